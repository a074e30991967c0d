//! The runtime contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::QueueError;

/// Delivery metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Consumers drop a second delivery with the same key.
    pub idempotency_key: String,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Headers {
    pub fn new(event_id: impl Into<String>, idempotency_key: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            idempotency_key: idempotency_key.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// What the runtime did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub event_id: String,
    /// `false` when the idempotency key had already been accepted.
    pub enqueued: bool,
}

/// An accepted event as stored by a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub headers: Headers,
    pub payload: Value,
}

/// A durable event runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn emit_with_headers(&self, topic: &str, payload: Value, headers: Headers) -> Result<Receipt, QueueError>;
}

/// An event claimed from a runtime for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Runtime-assigned handle passed back to [`Consumer::ack`] or [`Consumer::nack`].
    pub id: String,
    pub envelope: Envelope,
    /// Deliveries of this event so far, including this one.
    pub attempts: u32,
}

/// The consuming side of a runtime: workers claim one event at a time and
/// settle it.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Claim the oldest pending event on `topic`, if any.
    async fn claim(&self, topic: &str) -> Result<Option<Delivery>, QueueError>;

    /// The event was handled; never deliver it again.
    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError>;

    /// Handling failed; the runtime decides whether to redeliver.
    async fn nack(&self, delivery_id: &str, error: &str) -> Result<(), QueueError>;
}
