//! Idempotency records: deduplicating retried mutations per (actor, key).
//!
//! A caller-supplied key is claimed inside the same unit of work as the
//! mutation it protects. The record stores a fingerprint of the request and
//! the serialized response, so a retry with the same key and payload replays
//! the original result instead of repeating side effects.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use stockshift_core::{ActorId, DomainError, DomainResult, TransferId};
use stockshift_ledger::StockEvent;

use crate::store::StoreError;

/// Longest accepted idempotency key, after trimming.
pub const MAX_KEY_LEN: usize = 100;

pub const DEFAULT_TTL_HOURS: u32 = 48;
pub const MIN_TTL_HOURS: u32 = 24;

/// Operation an idempotency key was first used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdempotencyScope {
    #[serde(rename = "stock_event.create")]
    StockEventCreate,
    #[serde(rename = "transfer.confirm")]
    TransferConfirm,
}

impl IdempotencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::StockEventCreate => "stock_event.create",
            IdempotencyScope::TransferConfirm => "transfer.confirm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stock_event.create" => Some(IdempotencyScope::StockEventCreate),
            "transfer.confirm" => Some(IdempotencyScope::TransferConfirm),
            _ => None,
        }
    }
}

impl core::fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, non-empty idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Normalize a raw header value.
    ///
    /// Surrounding whitespace is trimmed and a blank value means "no key".
    pub fn parse(raw: Option<&str>) -> DomainResult<Option<Self>> {
        let Some(trimmed) = raw.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(None);
        };
        if trimmed.chars().count() > MAX_KEY_LEN {
            return Err(DomainError::validation("idempotency-key-too-long"));
        }
        Ok(Some(Self(trimmed.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn digest(canonical: &JsonValue) -> String {
    // serde_json maps are key-sorted, so the encoding is canonical.
    let bytes = canonical.to_string();
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

/// Fingerprint of a stock event request.
///
/// Covers type, warehouse, reason, notes and the signed lines sorted by
/// variant. Business time is left out so a client retry that re-stamps
/// `occurred_at` still matches.
pub fn stock_event_fingerprint(event: &StockEvent) -> String {
    let mut lines: Vec<(String, i64)> = event
        .lines
        .iter()
        .map(|line| (line.variant_id.to_string(), line.quantity))
        .collect();
    lines.sort();

    digest(&json!({
        "type": event.event_type.as_str(),
        "warehouseId": event.warehouse_id.to_string(),
        "reasonCode": event.reason_code.map(|r| r.as_str()),
        "notes": event.notes,
        "lines": lines
            .into_iter()
            .map(|(variant, quantity)| json!({ "variantId": variant, "quantity": quantity }))
            .collect::<Vec<_>>(),
    }))
}

/// Fingerprint of a transfer confirmation: the transfer it is bound to.
pub fn transfer_confirm_fingerprint(transfer_id: TransferId) -> String {
    digest(&json!({ "transferId": transfer_id.to_string() }))
}

/// Retention policy for idempotency records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    ttl: Duration,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self::from_hours(DEFAULT_TTL_HOURS)
    }
}

impl IdempotencyPolicy {
    /// TTL in hours; values under [`MIN_TTL_HOURS`] are raised to it.
    pub fn from_hours(hours: u32) -> Self {
        Self {
            ttl: Duration::hours(i64::from(hours.max(MIN_TTL_HOURS))),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.ttl
    }
}

/// Encode a response for storage on an idempotency record.
pub fn encode_response<T: Serialize>(response: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(response)
        .map_err(|e| StoreError::Serialization(format!("idempotent response encoding failed: {e}")))
}

/// A stored idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub actor_id: ActorId,
    pub key: IdempotencyKey,
    pub scope: IdempotencyScope,
    pub resource_id: Uuid,
    pub fingerprint: String,
    pub response: JsonValue,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Decode the stored response.
    pub fn replay<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.response.clone()).map_err(|e| {
            StoreError::Serialization(format!(
                "stored {} response for key {} is unreadable: {e}",
                self.scope, self.key
            ))
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A key the caller wants to bind to the mutation in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub actor_id: ActorId,
    pub key: IdempotencyKey,
    pub scope: IdempotencyScope,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyClaim {
    pub fn new(
        actor_id: ActorId,
        key: IdempotencyKey,
        scope: IdempotencyScope,
        fingerprint: String,
        policy: &IdempotencyPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            actor_id,
            key,
            scope,
            fingerprint,
            created_at: now,
            expires_at: policy.expires_at(now),
        }
    }

    /// Decide whether `existing` may be replayed for this claim.
    pub fn check_replay(&self, existing: &IdempotencyRecord) -> DomainResult<()> {
        if existing.scope != self.scope {
            return Err(DomainError::idempotency_conflict(format!(
                "key {} was already used for {}",
                self.key, existing.scope
            )));
        }
        if existing.fingerprint != self.fingerprint {
            let reason = match self.scope {
                IdempotencyScope::StockEventCreate => {
                    format!("key {} was already used with a different request", self.key)
                }
                IdempotencyScope::TransferConfirm => format!(
                    "key {} is bound to transfer {}",
                    self.key, existing.resource_id
                ),
            };
            return Err(DomainError::idempotency_conflict(reason));
        }
        Ok(())
    }

    pub fn into_record(self, resource_id: Uuid, response: JsonValue) -> IdempotencyRecord {
        IdempotencyRecord {
            actor_id: self.actor_id,
            key: self.key,
            scope: self.scope,
            resource_id,
            fingerprint: self.fingerprint,
            response,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Lookup and retention side of the idempotency store. Claims are made by
/// the ledger store inside its own units of work.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn find_idempotency(
        &self,
        actor_id: ActorId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete records whose TTL has elapsed; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
