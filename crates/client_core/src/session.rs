use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{CollaboratorId, Entry, EntryId, LogId, WriteSeq},
    error::StoreError,
    order::{OrderMap, RankPatch},
};
use storage::DocumentStore;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::{
    error::ReconcileError,
    reconciler::{DragOutcome, OrderedCollectionReconciler, RemoteOutcome},
};

/// One automatic retry after the first failed write.
const WRITE_ATTEMPTS: usize = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry_delay: Duration,
    pub event_capacity: usize,
    pub author: Option<CollaboratorId>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            author: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    OrderChanged { log_id: LogId, order: Vec<EntryId> },
    RemoteDeferred { log_id: LogId },
    WriteCommitted { log_id: LogId, seq: WriteSeq },
    WriteFailed { log_id: LogId, error: ReconcileError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// Nothing moved; no write was issued.
    Unchanged,
    Committed { seq: WriteSeq },
    /// Not persisted yet: a new drag started before this drop's turn to
    /// write came up. The next drop or `retry_pending` carries the change.
    Queued,
}

/// Owner of one log view. Gesture calls are synchronous; only drops, entry
/// changes and refreshes reach the store.
pub struct LogSession {
    log_id: LogId,
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<OrderedCollectionReconciler>>,
    /// Held by a flush for the whole of its write, so writes leave in the
    /// order their drops were staged.
    write_turn: Arc<AsyncMutex<()>>,
    events: broadcast::Sender<SessionEvent>,
    options: SessionOptions,
}

impl LogSession {
    pub async fn open(
        log_id: LogId,
        store: Arc<dyn DocumentStore>,
        options: SessionOptions,
    ) -> Result<Self, ReconcileError> {
        let order = store.get(&log_id).await.map_err(|error| {
            warn!(%log_id, %error, "failed to load log order");
            ReconcileError::from(error)
        })?;
        info!(%log_id, seq = order.seq(), entries = order.len(), "log session opened");
        Ok(Self::from_order(log_id, store, order, options))
    }

    pub fn from_order(
        log_id: LogId,
        store: Arc<dyn DocumentStore>,
        order: OrderMap,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            log_id,
            store,
            state: Arc::new(Mutex::new(OrderedCollectionReconciler::new(order))),
            write_turn: Arc::new(AsyncMutex::new(())),
            events,
            options,
        }
    }

    pub fn log_id(&self) -> &LogId {
        &self.log_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn order(&self) -> Vec<EntryId> {
        lock(&self.state).order()
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        lock(&self.state).sequence().to_vec()
    }

    pub fn persisted(&self) -> OrderMap {
        lock(&self.state).persisted().clone()
    }

    pub fn dragged(&self) -> Option<EntryId> {
        lock(&self.state).dragged().cloned()
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state).has_pending()
    }

    pub fn begin_drag(&self, id: &EntryId) -> Result<(), ReconcileError> {
        lock(&self.state).begin_drag(id)
    }

    pub fn drag_over(&self, source: &EntryId, target: &EntryId) -> DragOutcome {
        let (outcome, order) = {
            let mut guard = lock(&self.state);
            let outcome = guard.drag_over(source, target);
            (outcome, guard.order())
        };
        match outcome {
            DragOutcome::Moved { .. } => self.emit_order(order),
            DragOutcome::Stale => {
                debug!(log_id = %self.log_id, %source, %target, "ignoring drag over a stale entry");
            }
            DragOutcome::NoOp | DragOutcome::NotDragging => {}
        }
        outcome
    }

    pub fn cancel_drag(&self) {
        let order = {
            let mut guard = lock(&self.state);
            guard.cancel_drag();
            guard.order()
        };
        self.emit_order(order);
    }

    pub fn reconcile_remote(&self, remote: &OrderMap) -> RemoteOutcome {
        let (outcome, order) = {
            let mut guard = lock(&self.state);
            let outcome = guard.reconcile_remote(remote);
            (outcome, guard.order())
        };
        match outcome {
            RemoteOutcome::Applied => self.emit_order(order),
            RemoteOutcome::Deferred => {
                debug!(log_id = %self.log_id, seq = remote.seq(), "remote order deferred");
                let _ = self.events.send(SessionEvent::RemoteDeferred {
                    log_id: self.log_id.clone(),
                });
            }
        }
        outcome
    }

    pub fn discard_pending(&self) {
        let order = {
            let mut guard = lock(&self.state);
            guard.discard_pending();
            guard.order()
        };
        self.emit_order(order);
    }

    /// Finishes the gesture and persists the changed ranks. The write runs on
    /// its own task: if this future is dropped the write still completes, and
    /// its result is only folded back while the session is alive.
    ///
    /// A drop staged while an earlier write is in flight waits for that write
    /// and then reports the result of the write carrying its own ranks.
    pub async fn complete_drop(&self, dropped: &EntryId) -> Result<DropOutcome, ReconcileError> {
        let (staged, order) = {
            let mut guard = lock(&self.state);
            let staged = guard.stage_drop(dropped);
            (staged, guard.order())
        };
        self.emit_order(order);

        if staged.changed == 0 {
            return Ok(DropOutcome::Unchanged);
        }
        debug!(log_id = %self.log_id, changed = staged.changed, "drop staged");

        if let Some(seq) = self.flush().await? {
            return Ok(DropOutcome::Committed { seq });
        }
        // An earlier queued drop already wrote these ranks, unless a new drag
        // is holding them back.
        let guard = lock(&self.state);
        Ok(if guard.has_pending() {
            DropOutcome::Queued
        } else {
            DropOutcome::Committed {
                seq: guard.persisted().seq(),
            }
        })
    }

    /// Writes ranks left pending by an earlier failure.
    pub async fn retry_pending(&self) -> Result<Option<WriteSeq>, ReconcileError> {
        self.flush().await
    }

    /// Reads the log from the store and reconciles it. On failure the local
    /// order is left untouched.
    pub async fn refresh(&self) -> Result<RemoteOutcome, ReconcileError> {
        let remote = self.store.get(&self.log_id).await.map_err(|error| {
            warn!(log_id = %self.log_id, %error, "failed to refresh log order");
            ReconcileError::from(error)
        })?;
        Ok(self.reconcile_remote(&remote))
    }

    pub async fn add_entry(&self, id: EntryId) -> Result<WriteSeq, ReconcileError> {
        let patch = lock(&self.state).append_patch(&id)?;
        self.commit(patch.with_author(self.options.author.clone()))
            .await
    }

    pub async fn remove_entry(&self, id: &EntryId) -> Result<WriteSeq, ReconcileError> {
        let patch = lock(&self.state).removal_patch(id)?;
        self.commit(patch.with_author(self.options.author.clone()))
            .await
    }

    async fn commit(&self, patch: RankPatch) -> Result<WriteSeq, ReconcileError> {
        let seq = merge_with_retry(
            self.store.as_ref(),
            &self.log_id,
            &patch,
            self.options.retry_delay,
        )
        .await?;
        let order = {
            let mut guard = lock(&self.state);
            guard.apply_committed(&patch, seq);
            guard.order()
        };
        self.emit_order(order);
        let _ = self.events.send(SessionEvent::WriteCommitted {
            log_id: self.log_id.clone(),
            seq,
        });
        Ok(seq)
    }

    async fn flush(&self) -> Result<Option<WriteSeq>, ReconcileError> {
        let flusher = Flusher {
            log_id: self.log_id.clone(),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            write_turn: Arc::clone(&self.write_turn),
            events: self.events.clone(),
            retry_delay: self.options.retry_delay,
            author: self.options.author.clone(),
        };
        match tokio::spawn(flusher.run()).await {
            Ok(result) => result,
            Err(error) => Err(ReconcileError::WriteTask(error.to_string())),
        }
    }

    fn emit_order(&self, order: Vec<EntryId>) {
        let _ = self.events.send(SessionEvent::OrderChanged {
            log_id: self.log_id.clone(),
            order,
        });
    }
}

/// Writes the pending ranks once its turn comes up. The session state is held
/// strongly only until the patch is taken, so a view torn down mid-write is
/// never updated while the write itself still completes.
struct Flusher {
    log_id: LogId,
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<OrderedCollectionReconciler>>,
    write_turn: Arc<AsyncMutex<()>>,
    events: broadcast::Sender<SessionEvent>,
    retry_delay: Duration,
    author: Option<CollaboratorId>,
}

impl Flusher {
    async fn run(self) -> Result<Option<WriteSeq>, ReconcileError> {
        let _turn = Arc::clone(&self.write_turn).lock_owned().await;

        let Flusher {
            log_id,
            store,
            state,
            events,
            retry_delay,
            author,
            ..
        } = self;
        let next = lock(&state).next_write();
        let Some(patch) = next else {
            return Ok(None);
        };
        let patch = patch.with_author(author);
        let weak_state = Arc::downgrade(&state);
        drop(state);

        match merge_with_retry(store.as_ref(), &log_id, &patch, retry_delay).await {
            Ok(seq) => {
                let Some(state) = weak_state.upgrade() else {
                    debug!(%log_id, seq, "session closed before write resolved");
                    return Ok(Some(seq));
                };
                let order = {
                    let mut guard = lock(&state);
                    guard.ack_write(seq);
                    guard.order()
                };
                let _ = events.send(SessionEvent::WriteCommitted {
                    log_id: log_id.clone(),
                    seq,
                });
                let _ = events.send(SessionEvent::OrderChanged { log_id, order });
                Ok(Some(seq))
            }
            Err(error) => {
                let error = ReconcileError::from(error);
                if let Some(state) = weak_state.upgrade() {
                    let order = {
                        let mut guard = lock(&state);
                        guard.fail_write();
                        guard.order()
                    };
                    let _ = events.send(SessionEvent::WriteFailed {
                        log_id: log_id.clone(),
                        error: error.clone(),
                    });
                    let _ = events.send(SessionEvent::OrderChanged { log_id, order });
                }
                Err(error)
            }
        }
    }
}

async fn merge_with_retry(
    store: &dyn DocumentStore,
    log_id: &LogId,
    patch: &RankPatch,
    retry_delay: Duration,
) -> Result<WriteSeq, StoreError> {
    let mut attempt = 1;
    loop {
        match store.merge(log_id, patch).await {
            Ok(seq) => return Ok(seq),
            Err(error) if attempt < WRITE_ATTEMPTS => {
                warn!(%log_id, attempt, %error, "rank write failed; retrying");
                tokio::time::sleep(retry_delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(%log_id, attempt, %error, "rank write failed");
                return Err(error);
            }
        }
    }
}

fn lock(state: &Mutex<OrderedCollectionReconciler>) -> MutexGuard<'_, OrderedCollectionReconciler> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
