use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use shared::{
    domain::{LogId, WriteSeq},
    error::StoreError,
    order::{OrderMap, RankPatch},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{DocumentStore, StoreResult};

/// Process-local document store. Failures can be queued up front to exercise
/// retry and error paths without a network.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    logs: HashMap<LogId, OrderMap>,
    failing_reads: VecDeque<StoreError>,
    failing_writes: VecDeque<StoreError>,
    committed_writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, log_id: LogId, order: OrderMap) {
        self.inner.lock().await.logs.insert(log_id, order);
    }

    pub async fn fail_next_reads(&self, count: usize, error: StoreError) {
        let mut guard = self.inner.lock().await;
        guard
            .failing_reads
            .extend(std::iter::repeat(error).take(count));
    }

    pub async fn fail_next_writes(&self, count: usize, error: StoreError) {
        let mut guard = self.inner.lock().await;
        guard
            .failing_writes
            .extend(std::iter::repeat(error).take(count));
    }

    pub async fn committed_writes(&self) -> usize {
        self.inner.lock().await.committed_writes
    }

    pub async fn snapshot(&self, log_id: &LogId) -> OrderMap {
        self.inner
            .lock()
            .await
            .logs
            .get(log_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl MemoryState {
    fn commit(&mut self, log_id: &LogId, patch: &RankPatch) -> StoreResult<WriteSeq> {
        if let Some(error) = self.failing_writes.pop_front() {
            return Err(error);
        }
        let order = self.logs.entry(log_id.clone()).or_default();
        let seq = order.seq() + 1;
        order.apply_patch(patch, seq);
        self.committed_writes += 1;
        debug!(%log_id, seq, changed = patch.len(), "ranks committed");
        Ok(seq)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, log_id: &LogId) -> StoreResult<OrderMap> {
        let mut guard = self.inner.lock().await;
        if let Some(error) = guard.failing_reads.pop_front() {
            return Err(error);
        }
        Ok(guard.logs.get(log_id).cloned().unwrap_or_default())
    }

    async fn set(&self, log_id: &LogId, order: &OrderMap) -> StoreResult<WriteSeq> {
        let mut guard = self.inner.lock().await;
        let patch = guard
            .logs
            .get(log_id)
            .map(|current| current.replacement_patch(order))
            .unwrap_or_else(|| OrderMap::new().replacement_patch(order));
        guard.commit(log_id, &patch)
    }

    async fn merge(&self, log_id: &LogId, patch: &RankPatch) -> StoreResult<WriteSeq> {
        self.inner.lock().await.commit(log_id, patch)
    }
}
