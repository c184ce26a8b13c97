//! Domain error model.

use thiserror::Error;

use crate::id::{VariantId, WarehouseId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Kind of resource named in a `NotFound` error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Warehouse,
    Variant,
    Product,
    StockEvent,
    Transfer,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Warehouse => "warehouse",
            ResourceKind::Variant => "variant",
            ResourceKind::Product => "product",
            ResourceKind::StockEvent => "stock event",
            ResourceKind::Transfer => "transfer",
        }
    }
}

impl core::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
///
/// Deterministic business failures only. Lock timeouts and other store
/// failures are modelled by the infrastructure layer and never end up here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed, missing or contradictory input. The payload is a stable,
    /// kebab-case reason code (e.g. `empty-lines`).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: ResourceKind, id: String },

    /// A decreasing line would drive the balance below zero.
    #[error(
        "insufficient stock for variant {variant_id} in warehouse {warehouse_id}: \
         available {available}, requested {requested}"
    )]
    InsufficientStock {
        warehouse_id: WarehouseId,
        variant_id: VariantId,
        available: i64,
        requested: i64,
    },

    /// An idempotency key was reused for a different request or resource.
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("invalid state transition: cannot {action} a {from} transfer")]
    InvalidStateTransition { from: String, action: String },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: ResourceKind, id: impl core::fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn insufficient_stock(
        warehouse_id: WarehouseId,
        variant_id: VariantId,
        available: i64,
        requested: i64,
    ) -> Self {
        Self::InsufficientStock {
            warehouse_id,
            variant_id,
            available,
            requested,
        }
    }

    pub fn idempotency_conflict(msg: impl Into<String>) -> Self {
        Self::IdempotencyConflict(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, action: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            action: action.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Stable machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "VALIDATION_ERROR",
            DomainError::NotFound { .. } => "NOT_FOUND",
            DomainError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            DomainError::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            DomainError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            DomainError::InvalidId(_) => "INVALID_ID",
        }
    }

    /// HTTP status code suggestion.
    pub fn http_status(&self) -> u16 {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) => 400,
            DomainError::NotFound { .. } => 404,
            DomainError::InsufficientStock { .. }
            | DomainError::IdempotencyConflict(_)
            | DomainError::InvalidStateTransition { .. } => 409,
        }
    }

    /// Whether this is one of the 409-class conflicts.
    pub fn is_conflict(&self) -> bool {
        self.http_status() == 409
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_share_the_409_status() {
        let insufficient =
            DomainError::insufficient_stock(WarehouseId::new(), VariantId::new(), 0, 10);
        let idem = DomainError::idempotency_conflict("key reused");
        let transition = DomainError::invalid_transition("CANCELED", "confirm");

        for err in [&insufficient, &idem, &transition] {
            assert!(err.is_conflict(), "{err:?} should be a conflict");
        }
        assert_eq!(insufficient.code(), "INSUFFICIENT_STOCK");
        assert_eq!(idem.code(), "IDEMPOTENCY_CONFLICT");
        assert_eq!(transition.code(), "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn validation_and_not_found_are_client_errors() {
        assert_eq!(DomainError::validation("empty-lines").http_status(), 400);
        assert_eq!(
            DomainError::not_found(ResourceKind::Transfer, "abc").http_status(),
            404
        );
    }

    #[test]
    fn messages_name_the_resource_and_transition() {
        let err = DomainError::not_found(ResourceKind::StockEvent, "42");
        assert_eq!(err.to_string(), "stock event not found: 42");

        let err = DomainError::invalid_transition("CONFIRMED", "cancel");
        assert_eq!(
            err.to_string(),
            "invalid state transition: cannot cancel a CONFIRMED transfer"
        );
    }
}
