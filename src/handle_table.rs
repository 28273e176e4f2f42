//! Open-handle table: id allocation and exactly-once resource release (spec §5, C5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::File;
use tokio::sync::Mutex;
use whirlwind::ShardMap;

use crate::error::FabricError;

/// An open OS resource kept alive between a client's `OpenFile` and the
/// matching `Close` (spec §6.1). Wrapped in a `Mutex` because `ReadAt`/
/// `Lseek` need `&mut File` for positioned reads on some platforms while
/// several calls against the same handle can arrive concurrently.
pub struct OpenHandle {
    pub path: String,
    pub file: Mutex<File>,
    /// File size cached at open time (spec §3, "Handle" attributes).
    pub size: u64,
    pub is_dir: bool,
    /// Current seek position as tracked by `Lseek` (spec §4.6.5); `ReadAt`
    /// never reads or writes this (read-at is stateless w.r.t. position).
    pub position: Mutex<u64>,
}

/// Monotonic id allocator plus a concurrent map from id to open handle.
///
/// Grounded on the teacher's own handle-table idiom (`whirlwind::ShardMap`
/// already used for session/connection bookkeeping); ids are never reused,
/// so a stale id from a torn-down job can only ever miss, never alias
/// someone else's handle.
pub struct HandleTable {
    next_id: AtomicU64,
    handles: ShardMap<u64, Arc<OpenHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), handles: ShardMap::new() }
    }

    pub async fn insert(&self, path: String, file: File, size: u64, is_dir: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(OpenHandle {
            path,
            file: Mutex::new(file),
            size,
            is_dir,
            position: Mutex::new(0),
        });
        self.handles.insert(id, handle).await;
        id
    }

    pub async fn get(&self, id: u64) -> Result<Arc<OpenHandle>, FabricError> {
        self.handles
            .get(&id)
            .await
            .map(|entry| entry.clone())
            .ok_or_else(|| FabricError::not_found(format!("no open handle {id}")))
    }

    /// Removes and returns the handle so the caller can run teardown
    /// (closing the fd) exactly once, even under concurrent `Close` calls
    /// racing each other (spec §6.1, "Close is idempotent").
    pub async fn remove(&self, id: u64) -> Option<Arc<OpenHandle>> {
        self.handles.remove(&id).await.map(|(_, handle)| handle)
    }

    pub async fn len(&self) -> usize {
        self.handles.len().await
    }

    /// Drains every outstanding handle, used when a job's session tears
    /// down without the client closing its handles first (spec §5,
    /// "job shutdown releases every resource it still owns").
    pub async fn clear(&self) -> Vec<Arc<OpenHandle>> {
        let mut drained = Vec::new();
        for (id, _) in self.handles.iter().await {
            if let Some((_, handle)) = self.handles.remove(id).await {
                drained.push(handle);
            }
        }
        drained
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
