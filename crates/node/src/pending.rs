//! Table of in-flight calls awaiting a reply.
//!
//! Every entry can be settled from two sides: a matching response, or its
//! own timeout timer.  Whichever arrives first wins; the other finds the
//! entry gone and becomes a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mc_domain::MeshError;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub type Settlement<T> = oneshot::Receiver<Result<T, MeshError>>;

struct Entry<T> {
    tx: oneshot::Sender<Result<T, MeshError>>,
    tag: Option<String>,
    timer: JoinHandle<()>,
}

type Table<T> = Mutex<HashMap<String, Entry<T>>>;

/// Fresh call identifier.
pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Bounded pending-call table keyed by call id.
pub struct PendingCalls<T> {
    entries: Arc<Table<T>>,
    max_pending: usize,
}

impl<T: Send + 'static> PendingCalls<T> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_pending,
        }
    }

    /// Register `id` and arm its timeout.
    pub fn register(&self, id: impl Into<String>, timeout: Duration) -> Result<Settlement<T>, MeshError> {
        self.insert(id.into(), None, timeout)
    }

    /// Register `id` under `tag` (typically a connection id) so it can be
    /// failed together with its siblings via [`fail_tagged`](Self::fail_tagged).
    pub fn register_tagged(
        &self,
        id: impl Into<String>,
        tag: impl Into<String>,
        timeout: Duration,
    ) -> Result<Settlement<T>, MeshError> {
        self.insert(id.into(), Some(tag.into()), timeout)
    }

    fn insert(&self, id: String, tag: Option<String>, timeout: Duration) -> Result<Settlement<T>, MeshError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_pending {
            return Err(MeshError::Overloaded(format!(
                "{} calls already pending",
                entries.len()
            )));
        }
        if entries.contains_key(&id) {
            return Err(MeshError::Transport(format!("duplicate call id {id}")));
        }
        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(expire(Arc::downgrade(&self.entries), id.clone(), timeout));
        entries.insert(id, Entry { tx, tag, timer });
        Ok(rx)
    }

    /// Settle `id` with `outcome`.  Returns `false` if the call was already
    /// settled (or never existed); the outcome is then discarded.
    pub fn settle(&self, id: &str, outcome: Result<T, MeshError>) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                // The waiter may have given up; nothing to do then.
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(call_id = %id, "late settlement discarded");
                false
            }
        }
    }

    /// Fail every call registered under `tag`.  Returns how many were failed.
    pub fn fail_tagged(&self, tag: &str, err: MeshError) -> usize {
        let drained: Vec<Entry<T>> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.tag.as_deref() == Some(tag))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let n = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(err.clone()));
        }
        n
    }

    /// Fail every outstanding call.
    pub fn fail_all(&self, err: MeshError) -> usize {
        let drained: Vec<Entry<T>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let n = drained.len();
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(err.clone()));
        }
        n
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

async fn expire<T>(entries: Weak<Table<T>>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let entry = entries.lock().remove(&id);
    if let Some(entry) = entry {
        tracing::debug!(call_id = %id, ?timeout, "pending call timed out");
        let _ = entry
            .tx
            .send(Err(MeshError::Timeout(format!("call {id} timed out after {timeout:?}"))));
    }
}
