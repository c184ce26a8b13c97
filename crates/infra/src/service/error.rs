use thiserror::Error;

use stockshift_core::DomainError;

use crate::store::StoreError;

/// Error returned by the ledger services.
///
/// Callers map it to a response through [`ServiceError::code`] and
/// [`ServiceError::http_status`] without inspecting variants:
///
/// - business rejections keep the domain taxonomy (400/404/409);
/// - `Transient` means the unit of work gave up after bounded retries (503);
/// - `Internal` is everything else (500).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(err) => ServiceError::Domain(err),
            StoreError::LockTimeout(message) | StoreError::Transient(message) => {
                ServiceError::Transient {
                    operation: "store",
                    attempts: 1,
                    message,
                }
            }
            StoreError::Serialization(_) | StoreError::Backend(_) => {
                ServiceError::Internal(value.to_string())
            }
        }
    }
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Domain(err) => err.code(),
            ServiceError::Transient { .. } => "TRANSIENT",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Domain(err) => err.http_status(),
            ServiceError::Transient { .. } => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Whether the caller may safely resubmit (with the same idempotency key).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            ServiceError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockshift_core::{ResourceKind, VariantId, WarehouseId};

    #[test]
    fn store_errors_map_onto_the_service_taxonomy() {
        let lock: ServiceError = StoreError::LockTimeout("stock_items".to_string()).into();
        assert_eq!(lock.code(), "TRANSIENT");
        assert_eq!(lock.http_status(), 503);
        assert!(lock.is_retryable());

        let backend: ServiceError = StoreError::Backend("connection reset".to_string()).into();
        assert_eq!(backend.code(), "INTERNAL_ERROR");
        assert_eq!(backend.http_status(), 500);
        assert!(!backend.is_retryable());

        let domain: ServiceError = StoreError::Domain(DomainError::insufficient_stock(
            WarehouseId::new(),
            VariantId::new(),
            3,
            5,
        ))
        .into();
        assert_eq!(domain.code(), "INSUFFICIENT_STOCK");
        assert_eq!(domain.http_status(), 409);
    }

    #[test]
    fn not_found_keeps_its_status() {
        let err = ServiceError::from(DomainError::not_found(ResourceKind::Transfer, "t-1"));
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
