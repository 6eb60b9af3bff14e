//! In-process document store
//!
//! Backs the demo and every test. Each write bumps a global sequence number
//! that serves as the version of the written document and of its parent
//! collection, which is what `commit` compares against.

use async_trait::async_trait;
use log::{debug, trace};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::{
    ChangeKind, CollectionPath, CollectionSnapshot, DocPath, DocumentChange, DocumentSnapshot,
    DocumentStore, Fields, Query, QuerySnapshot, ReadSet, StoreError, Subscription, TxView, Write,
};

const AUTO_ID_LEN: usize = 20;

#[derive(Debug, Clone, Default)]
struct Entry {
    data: Option<Fields>,
    version: u64,
}

struct DocWatcher {
    path: DocPath,
    sender: mpsc::UnboundedSender<DocumentSnapshot>,
}

struct QueryWatcher {
    query: Query,
    known: BTreeMap<String, Fields>,
    sender: mpsc::UnboundedSender<QuerySnapshot>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    // Deleted documents stay as tombstones so their version keeps moving
    docs: BTreeMap<DocPath, Entry>,
    collections: HashMap<CollectionPath, u64>,
    doc_watchers: Vec<DocWatcher>,
    query_watchers: Vec<QueryWatcher>,
    offline: bool,
}

impl Inner {
    fn snapshot(&self, path: &DocPath) -> DocumentSnapshot {
        let entry = self.docs.get(path).cloned().unwrap_or_default();
        DocumentSnapshot {
            path: path.clone(),
            data: entry.data,
            version: entry.version,
        }
    }

    fn children(&self, collection: &CollectionPath) -> BTreeMap<String, Fields> {
        self.docs
            .iter()
            .filter(|(path, _)| &path.parent() == collection)
            .filter_map(|(path, entry)| {
                entry
                    .data
                    .as_ref()
                    .map(|data| (path.id().to_string(), data.clone()))
            })
            .collect()
    }

    fn matching(&self, query: &Query) -> BTreeMap<String, Fields> {
        self.children(query.collection())
            .into_iter()
            .filter(|(_, data)| query.matches(data))
            .collect()
    }

    fn apply(&mut self, write: Write, touched: &mut HashSet<DocPath>) {
        self.seq += 1;
        let version = self.seq;
        let path = match write {
            Write::Set {
                path,
                fields,
                merge,
            } => {
                let entry = self.docs.entry(path.clone()).or_default();
                match (&mut entry.data, merge) {
                    (Some(existing), true) => existing.extend(fields),
                    _ => entry.data = Some(fields),
                }
                entry.version = version;
                path
            }
            Write::Delete { path } => {
                let entry = self.docs.entry(path.clone()).or_default();
                entry.data = None;
                entry.version = version;
                path
            }
        };
        self.collections.insert(path.parent(), version);
        touched.insert(path);
    }

    fn notify(&mut self, touched: &HashSet<DocPath>) {
        let mut doc_watchers = std::mem::take(&mut self.doc_watchers);
        doc_watchers.retain(|watcher| {
            if !touched.contains(&watcher.path) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(self.snapshot(&watcher.path)).is_ok()
        });
        self.doc_watchers = doc_watchers;

        let collections: HashSet<CollectionPath> = touched.iter().map(DocPath::parent).collect();
        let mut query_watchers = std::mem::take(&mut self.query_watchers);
        query_watchers.retain_mut(|watcher| {
            if !collections.contains(watcher.query.collection()) {
                return !watcher.sender.is_closed();
            }
            let current = self.matching(&watcher.query);
            let changes = diff(&watcher.known, &current);
            if changes.is_empty() {
                return !watcher.sender.is_closed();
            }
            let snapshot = QuerySnapshot {
                docs: current.clone().into_iter().collect(),
                changes,
            };
            watcher.known = current;
            watcher.sender.send(snapshot).is_ok()
        });
        self.query_watchers = query_watchers;
    }
}

fn diff(known: &BTreeMap<String, Fields>, current: &BTreeMap<String, Fields>) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    for (id, data) in current {
        match known.get(id) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                id: id.clone(),
                data: data.clone(),
            }),
            Some(previous) if previous != data => changes.push(DocumentChange {
                kind: ChangeKind::Modified,
                id: id.clone(),
                data: data.clone(),
            }),
            Some(_) => {}
        }
    }
    for (id, data) in known {
        if !current.contains_key(id) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                id: id.clone(),
                data: data.clone(),
            });
        }
    }
    changes
}

/// Document store held in process memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the connection to the backend. While offline every
    /// operation fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offline = offline;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?;
        if inner.offline {
            return Err(StoreError::Unavailable("offline".to_string()));
        }
        Ok(inner)
    }

    fn write_batch(&self, inner: &mut Inner, writes: Vec<Write>) {
        let mut touched = HashSet::new();
        for write in writes {
            inner.apply(write, &mut touched);
        }
        trace!("Applied writes to {} documents", touched.len());
        inner.notify(&touched);
    }
}

fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<DocumentSnapshot, StoreError> {
        Ok(self.lock()?.snapshot(path))
    }

    async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let write = Write::Set {
            path: path.clone(),
            fields,
            merge,
        };
        self.write_batch(&mut inner, vec![write]);
        Ok(())
    }

    async fn add(&self, collection: &CollectionPath, fields: Fields) -> Result<DocPath, StoreError> {
        let mut inner = self.lock()?;
        let path = loop {
            let candidate = collection.doc(&auto_id());
            if !inner.docs.contains_key(&candidate) {
                break candidate;
            }
        };
        let write = Write::Set {
            path: path.clone(),
            fields,
            merge: false,
        };
        self.write_batch(&mut inner, vec![write]);
        Ok(path)
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        self.write_batch(&mut inner, vec![Write::Delete { path: path.clone() }]);
        Ok(())
    }

    async fn read(&self, reads: &ReadSet) -> Result<TxView, StoreError> {
        let inner = self.lock()?;
        let mut view = TxView::default();
        for path in &reads.docs {
            view.docs.insert(path.clone(), inner.snapshot(path));
        }
        for collection in &reads.collections {
            let snapshot = CollectionSnapshot {
                version: inner.collections.get(collection).copied().unwrap_or(0),
                docs: inner.children(collection).into_iter().collect(),
            };
            view.collections.insert(collection.clone(), snapshot);
        }
        Ok(view)
    }

    async fn commit(&self, view: &TxView, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let stale_doc = view
            .docs
            .iter()
            .any(|(path, snap)| inner.docs.get(path).map(|e| e.version).unwrap_or(0) != snap.version);
        let stale_collection = view.collections.iter().any(|(path, snap)| {
            inner.collections.get(path).copied().unwrap_or(0) != snap.version
        });
        if stale_doc || stale_collection {
            debug!("Rejecting commit of {} writes: read set changed", writes.len());
            return Err(StoreError::Conflict);
        }
        self.write_batch(&mut inner, writes);
        Ok(())
    }

    fn watch_document(&self, path: &DocPath) -> Result<Subscription<DocumentSnapshot>, StoreError> {
        let mut inner = self.lock()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail
        let _ = sender.send(inner.snapshot(path));
        inner.doc_watchers.push(DocWatcher {
            path: path.clone(),
            sender,
        });
        Ok(Subscription::new(receiver))
    }

    fn watch_query(&self, query: Query) -> Result<Subscription<QuerySnapshot>, StoreError> {
        let mut inner = self.lock()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let known = inner.matching(&query);
        let initial = QuerySnapshot {
            docs: known.clone().into_iter().collect(),
            changes: diff(&BTreeMap::new(), &known),
        };
        let _ = sender.send(initial);
        inner.query_watchers.push(QueryWatcher {
            query,
            known,
            sender,
        });
        Ok(Subscription::new(receiver))
    }
}
