//! In-process runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::{Consumer, Delivery, Envelope, Headers, QueueError, Receipt, Runtime};

#[derive(Debug, Default)]
struct Inner {
    delivered: Vec<Envelope>,
    seen_keys: HashSet<String>,
    /// Number of upcoming emits to reject.
    fail_next: usize,
    fail_all: bool,
    /// Event IDs handed to a consumer.
    claimed: HashSet<String>,
    acked: HashSet<String>,
    /// Event ID to the error it was rejected with.
    dead_lettered: HashMap<String, String>,
}

/// Records accepted events in memory and de-duplicates by idempotency key.
///
/// Failures can be scripted with [`MemoryRuntime::fail_next`] and
/// [`MemoryRuntime::set_unavailable`]. As a [`Consumer`] it hands out each
/// accepted event once, in emit order; a rejected delivery is dead-lettered
/// straight away.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` emits.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().fail_all = unavailable;
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        self.inner.lock().delivered.clone()
    }

    pub fn delivered_topics(&self) -> Vec<String> {
        self.inner.lock().delivered.iter().map(|e| e.topic.clone()).collect()
    }

    /// Accepted events on `topic` no consumer has claimed yet.
    pub fn pending(&self, topic: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .delivered
            .iter()
            .filter(|e| e.topic == topic && !inner.claimed.contains(&e.headers.event_id))
            .count()
    }

    pub fn acked(&self) -> usize {
        self.inner.lock().acked.len()
    }

    pub fn dead_lettered(&self) -> HashMap<String, String> {
        self.inner.lock().dead_lettered.clone()
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn emit_with_headers(&self, topic: &str, payload: Value, headers: Headers) -> Result<Receipt, QueueError> {
        let mut inner = self.inner.lock();
        if inner.fail_all {
            return Err(QueueError::Unavailable("runtime marked unavailable".into()));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(QueueError::Unavailable("scripted failure".into()));
        }

        let event_id = headers.event_id.clone();
        if !inner.seen_keys.insert(headers.idempotency_key.clone()) {
            debug!(topic, idempotency_key = %headers.idempotency_key, "duplicate event suppressed");
            return Ok(Receipt { event_id, enqueued: false });
        }

        inner.delivered.push(Envelope {
            topic: topic.to_string(),
            headers,
            payload,
        });
        Ok(Receipt { event_id, enqueued: true })
    }
}

#[async_trait]
impl Consumer for MemoryRuntime {
    async fn claim(&self, topic: &str) -> Result<Option<Delivery>, QueueError> {
        let mut inner = self.inner.lock();
        let Some(envelope) = inner
            .delivered
            .iter()
            .find(|e| e.topic == topic && !inner.claimed.contains(&e.headers.event_id))
            .cloned()
        else {
            return Ok(None);
        };
        inner.claimed.insert(envelope.headers.event_id.clone());
        Ok(Some(Delivery {
            id: envelope.headers.event_id.clone(),
            envelope,
            attempts: 1,
        }))
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError> {
        self.inner.lock().acked.insert(delivery_id.to_string());
        Ok(())
    }

    async fn nack(&self, delivery_id: &str, error: &str) -> Result<(), QueueError> {
        debug!(delivery_id, error, "delivery dead-lettered");
        self.inner
            .lock()
            .dead_lettered
            .insert(delivery_id.to_string(), error.to_string());
        Ok(())
    }
}
