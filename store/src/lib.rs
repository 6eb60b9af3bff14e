//! Shared document store used for room coordination
//!
//! Clients never talk to each other directly until a peer connection is
//! up. Presence, the PTT lock and signaling records all live in a store of
//! JSON documents grouped into collections, with realtime subscriptions and
//! optimistic transactions.

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod layout;
pub mod memory;
pub mod path;

pub use memory::MemoryStore;
pub use path::{CollectionPath, DocPath, Query};

/// Field map of one document.
pub type Fields = serde_json::Map<String, Value>;

/// Transactions give up after this many conflicting attempts.
pub const MAX_TX_ATTEMPTS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transaction conflict")]
    Conflict,

    #[error("transaction aborted after {0} attempts")]
    Aborted(usize),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for room_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => room_core::Error::Serialization(msg),
            other => room_core::Error::Store(other.to_string()),
        }
    }
}

/// A document as seen at some version. `data` is `None` when it does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub path: DocPath,
    pub data: Option<Fields>,
    pub version: u64,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document entering, changing within, or leaving a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    pub data: Fields,
}

/// Query result together with the changes since the previous delivery.
///
/// The first snapshot of a subscription reports every match as `Added`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySnapshot {
    pub docs: Vec<(String, Fields)>,
    pub changes: Vec<DocumentChange>,
}

/// Documents and collections a transaction depends on.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    pub docs: Vec<DocPath>,
    pub collections: Vec<CollectionPath>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc(mut self, path: DocPath) -> Self {
        self.docs.push(path);
        self
    }

    /// Depend on the whole membership of a collection. Any write to a
    /// child document invalidates the read.
    pub fn collection(mut self, path: CollectionPath) -> Self {
        self.collections.push(path);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSnapshot {
    pub version: u64,
    pub docs: Vec<(String, Fields)>,
}

/// Consistent view of a `ReadSet`, used to decide a transaction's writes.
#[derive(Debug, Clone, Default)]
pub struct TxView {
    pub docs: HashMap<DocPath, DocumentSnapshot>,
    pub collections: HashMap<CollectionPath, CollectionSnapshot>,
}

impl TxView {
    pub fn doc(&self, path: &DocPath) -> Option<&Fields> {
        self.docs.get(path).and_then(|snap| snap.data.as_ref())
    }

    pub fn collection(&self, path: &CollectionPath) -> &[(String, Fields)] {
        self.collections
            .get(path)
            .map(|snap| snap.docs.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replace the document, or merge top level fields into it.
    Set {
        path: DocPath,
        fields: Fields,
        merge: bool,
    },
    Delete {
        path: DocPath,
    },
}

/// Live feed of snapshots. Dropping it ends the subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>) -> Self {
        Self { receiver }
    }

    /// Next snapshot, or `None` once the store dropped the subscription.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Realtime document store with optimistic transactions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<DocumentSnapshot, StoreError>;

    async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<(), StoreError>;

    /// Create a document with a generated id.
    async fn add(&self, collection: &CollectionPath, fields: Fields) -> Result<DocPath, StoreError>;

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Read everything a transaction depends on at one point in time.
    async fn read(&self, reads: &ReadSet) -> Result<TxView, StoreError>;

    /// Apply `writes` atomically if nothing in `view` changed since it was
    /// read, otherwise fail with `StoreError::Conflict`.
    async fn commit(&self, view: &TxView, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Current snapshot first, then one snapshot per change.
    fn watch_document(&self, path: &DocPath) -> Result<Subscription<DocumentSnapshot>, StoreError>;

    fn watch_query(&self, query: Query) -> Result<Subscription<QuerySnapshot>, StoreError>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

/// Run a read-decide-write transaction, retrying on conflicts.
///
/// `decide` may run several times and must not have side effects.
pub async fn run_transaction<T, F>(
    store: &dyn DocumentStore,
    reads: &ReadSet,
    mut decide: F,
) -> Result<T, StoreError>
where
    F: FnMut(&TxView) -> Result<(T, Vec<Write>), StoreError>,
{
    for attempt in 1..=MAX_TX_ATTEMPTS {
        let view = store.read(reads).await?;
        let (result, writes) = decide(&view)?;
        if writes.is_empty() {
            return Ok(result);
        }
        match store.commit(&view, writes).await {
            Ok(()) => return Ok(result),
            Err(StoreError::Conflict) => {
                debug!("Transaction conflict on attempt {}", attempt);
                let jitter = rand::thread_rng().gen_range(2..10 * attempt as u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Aborted(MAX_TX_ATTEMPTS))
}

pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Serialization(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(StoreError::Serialization(e.to_string())),
    }
}

pub fn from_fields<T: DeserializeOwned>(fields: &Fields) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(fields.clone()))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        owner_id: String,
        created_at: u64,
    }

    #[test]
    fn fields_round_trip_through_serde() {
        let sample = Sample {
            owner_id: "host".into(),
            created_at: 7,
        };
        let fields = to_fields(&sample).unwrap();
        assert_eq!(fields.get("ownerId"), Some(&json!("host")));
        assert_eq!(from_fields::<Sample>(&fields).unwrap(), sample);
    }

    #[test]
    fn non_object_values_are_rejected() {
        assert!(matches!(
            to_fields(&42u32),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn store_errors_convert_to_core_errors() {
        let err: room_core::Error = StoreError::Aborted(5).into();
        assert!(err.to_string().contains("aborted after 5 attempts"));
    }
}
