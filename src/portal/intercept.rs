//! Interception buffer: append-only store of recognized network payloads.
//!
//! One buffer is created per run and shared (behind an `Arc`) between the
//! bridge pump, which appends, and the pagination driver and reconciliation
//! engine, which only read. Payload identity comes from the body's shape, not
//! the transport URL, since the portal multiplexes unrelated queries over a
//! single endpoint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::profile::ShapeSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    BillingData,
    OtherDocuments,
    ContactData,
}

#[derive(Debug, Clone)]
pub struct InterceptedPayload {
    pub kind: PayloadKind,
    pub body: Value,
    /// Hook-assigned delivery sequence.
    pub sequence: u64,
    /// Position in the buffer.
    pub index: usize,
    pub source_url: Option<String>,
}

#[derive(Default)]
struct Entries {
    payloads: Vec<Arc<InterceptedPayload>>,
    seen_sequences: HashSet<u64>,
}

pub struct InterceptionBuffer {
    signatures: Vec<ShapeSignature>,
    entries: Mutex<Entries>,
    len_tx: watch::Sender<usize>,
}

impl InterceptionBuffer {
    pub fn new(signatures: Vec<ShapeSignature>) -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            signatures,
            entries: Mutex::new(Entries::default()),
            len_tx,
        }
    }

    /// Records a raw response body. Never fails: malformed JSON and
    /// unrecognized shapes are dropped. Returns the kind that was stored.
    pub fn record(&self, sequence: u64, source_url: Option<&str>, raw: &str) -> Option<PayloadKind> {
        match serde_json::from_str::<Value>(raw) {
            Ok(body) => self.record_value(sequence, source_url, body),
            Err(error) => {
                warn!(sequence, url = source_url, %error, "dropping malformed intercepted body");
                None
            }
        }
    }

    pub fn record_value(
        &self,
        sequence: u64,
        source_url: Option<&str>,
        body: Value,
    ) -> Option<PayloadKind> {
        let Some(kind) = self.classify(&body) else {
            debug!(sequence, url = source_url, "ignoring unrecognized payload shape");
            return None;
        };

        let len = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if !entries.seen_sequences.insert(sequence) {
                debug!(sequence, %kind, "ignoring duplicate delivery");
                return None;
            }
            let index = entries.payloads.len();
            entries.payloads.push(Arc::new(InterceptedPayload {
                kind,
                body,
                sequence,
                index,
                source_url: source_url.map(ToOwned::to_owned),
            }));
            entries.payloads.len()
        };

        debug!(sequence, %kind, len, "payload intercepted");
        self.len_tx.send_replace(len);
        Some(kind)
    }

    /// First signature whose shape matches `body`.
    pub fn classify(&self, body: &Value) -> Option<PayloadKind> {
        self.signatures
            .iter()
            .find(|signature| shape_matches(signature, body))
            .map(|signature| signature.kind)
    }

    pub fn count(&self, kinds: &[PayloadKind]) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .payloads
            .iter()
            .filter(|p| kinds.contains(&p.kind))
            .count()
    }

    /// Non-blocking liveness predicate used by the pagination driver.
    pub fn size_at_least(&self, kinds: &[PayloadKind], n: usize) -> bool {
        self.count(kinds) >= n
    }

    /// Resolves once `size_at_least(kinds, n)` holds. Callers bound it.
    pub async fn grown_to(&self, kinds: &[PayloadKind], n: usize) {
        let mut rx = self.len_tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|_| self.size_at_least(kinds, n)).await;
    }

    /// Most recently recorded payload of `kind`.
    pub fn latest(&self, kind: PayloadKind) -> Option<Arc<InterceptedPayload>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.payloads.iter().rev().find(|p| p.kind == kind).cloned()
    }

    pub fn len(&self) -> usize {
        *self.len_tx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn shape_matches(signature: &ShapeSignature, body: &Value) -> bool {
    signature
        .anchors
        .iter()
        .filter_map(|anchor| body.pointer(anchor))
        .any(|found| carries_keys(found, &signature.item_keys))
}

fn carries_keys(value: &Value, keys: &[String]) -> bool {
    let has_all = |item: &Value| {
        item.as_object()
            .is_some_and(|obj| keys.iter().all(|k| obj.contains_key(k)))
    };
    match value {
        Value::Array(items) => items.iter().all(has_all),
        Value::Object(_) => has_all(value),
        _ => false,
    }
}
