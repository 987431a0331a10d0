//! Local, synchronous half of log ordering.
//!
//! [`OrderedCollectionReconciler`] owns the on-screen sequence of one log and
//! turns drag gestures into rank patches. It never talks to the store itself:
//! the session drives writes through [`next_write`], [`ack_write`] and
//! [`fail_write`], so every transition here is deterministic and testable
//! without a runtime.
//!
//! [`next_write`]: OrderedCollectionReconciler::next_write
//! [`ack_write`]: OrderedCollectionReconciler::ack_write
//! [`fail_write`]: OrderedCollectionReconciler::fail_write

use std::collections::BTreeMap;

use shared::{
    domain::{Entry, EntryId, Rank, WriteSeq},
    order::{compare_entries, OrderMap, RankPatch},
};

use tracing::debug;

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragOutcome {
    Moved { from: usize, to: usize },
    /// Self-drag, or a redundant call.
    NoOp,
    /// Source or target is no longer part of the log, or the source is not
    /// the dragged entry.
    Stale,
    NotDragging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Held back until the active drag or write resolves.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedDrop {
    /// Entries whose rank now differs from the last acknowledged order.
    pub changed: usize,
}

#[derive(Debug, Clone)]
pub struct OrderedCollectionReconciler {
    persisted: OrderMap,
    pending: BTreeMap<EntryId, Rank>,
    in_flight: Option<RankPatch>,
    deferred: Option<OrderMap>,
    dragging: Option<EntryId>,
    sequence: Vec<Entry>,
}

impl OrderedCollectionReconciler {
    pub fn new(persisted: OrderMap) -> Self {
        let mut reconciler = Self {
            persisted,
            pending: BTreeMap::new(),
            in_flight: None,
            deferred: None,
            dragging: None,
            sequence: Vec::new(),
        };
        reconciler.materialize();
        reconciler
    }

    pub fn sequence(&self) -> &[Entry] {
        &self.sequence
    }

    pub fn order(&self) -> Vec<EntryId> {
        self.sequence.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn dragged(&self) -> Option<&EntryId> {
        self.dragging.as_ref()
    }

    pub fn persisted(&self) -> &OrderMap {
        &self.persisted
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.position(id).is_some()
    }

    /// True while some local rank has not been acknowledged by the store.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.in_flight.is_some()
    }

    pub fn is_write_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_deferred_remote(&self) -> bool {
        self.deferred.is_some()
    }

    fn position(&self, id: &EntryId) -> Option<usize> {
        self.sequence.iter().position(|entry| &entry.id == id)
    }

    /// Rank the store will hold for `id` once the in-flight write lands.
    fn baseline(&self, id: &EntryId) -> Option<Rank> {
        let persisted = self.persisted.rank(id)?;
        Some(
            self.in_flight
                .as_ref()
                .and_then(|patch| patch.upserts.get(id).copied())
                .unwrap_or(persisted),
        )
    }

    fn display_rank(&self, id: &EntryId, persisted: Rank) -> Rank {
        self.pending
            .get(id)
            .copied()
            .or_else(|| {
                self.in_flight
                    .as_ref()
                    .and_then(|patch| patch.upserts.get(id).copied())
            })
            .unwrap_or(persisted)
    }

    pub fn begin_drag(&mut self, id: &EntryId) -> Result<(), ReconcileError> {
        if let Some(current) = &self.dragging {
            return Err(ReconcileError::DragInProgress(current.clone()));
        }
        if !self.contains(id) {
            return Err(ReconcileError::StaleReference(id.clone()));
        }
        self.dragging = Some(id.clone());
        Ok(())
    }

    /// Moves `source` to the slot of `target`. The ranks that occupied the
    /// affected range are handed out again in display order, so the dragged
    /// entry takes the target's rank and everything in between shifts one
    /// slot toward the vacated position.
    pub fn drag_over(&mut self, source: &EntryId, target: &EntryId) -> DragOutcome {
        let Some(dragged) = &self.dragging else {
            return DragOutcome::NotDragging;
        };
        if source == target {
            return DragOutcome::NoOp;
        }
        // Only the entry picked up by `begin_drag` may move.
        if dragged != source {
            return DragOutcome::Stale;
        }
        let (Some(from), Some(to)) = (self.position(source), self.position(target)) else {
            return DragOutcome::Stale;
        };

        let (low, high) = (from.min(to), from.max(to));
        let ranks: Vec<Rank> = self.sequence[low..=high]
            .iter()
            .map(|entry| entry.rank)
            .collect();

        let moved = self.sequence.remove(from);
        self.sequence.insert(to, moved);
        for (entry, rank) in self.sequence[low..=high].iter_mut().zip(ranks) {
            entry.rank = rank;
        }

        DragOutcome::Moved { from, to }
    }

    /// Ends the gesture: renumbers the sequence `0..n-1` and records every rank
    /// that differs from the acknowledged order as pending. The dragged
    /// reference is cleared even when nothing changed.
    pub fn stage_drop(&mut self, dropped: &EntryId) -> StagedDrop {
        let Some(dragged) = self.dragging.take() else {
            return StagedDrop { changed: 0 };
        };
        if &dragged != dropped {
            debug!(%dragged, %dropped, "drop reported for a different entry than dragged");
        }

        for (index, entry) in self.sequence.iter_mut().enumerate() {
            entry.rank = index as Rank;
        }

        let mut pending = BTreeMap::new();
        for entry in &self.sequence {
            // Entries removed while the gesture was running have no baseline.
            match self.baseline(&entry.id) {
                Some(rank) if rank != entry.rank => {
                    pending.insert(entry.id.clone(), entry.rank);
                }
                _ => {}
            }
        }
        let changed = pending.len();
        self.pending = pending;
        self.settle();
        StagedDrop { changed }
    }

    /// Abandons the gesture and shows the last-known-good order again.
    pub fn cancel_drag(&mut self) {
        self.dragging = None;
        self.settle();
    }

    pub fn reconcile_remote(&mut self, remote: &OrderMap) -> RemoteOutcome {
        if self.dragging.is_some() || self.in_flight.is_some() {
            match &mut self.deferred {
                Some(deferred) => deferred.join(remote),
                None => self.deferred = Some(remote.clone()),
            }
            return RemoteOutcome::Deferred;
        }
        self.absorb(remote);
        self.materialize();
        RemoteOutcome::Applied
    }

    /// Takes the pending ranks as the next write, unless a drag is active or
    /// another write has not resolved yet.
    pub fn next_write(&mut self) -> Option<RankPatch> {
        if self.dragging.is_some() || self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        let patch = RankPatch {
            upserts: std::mem::take(&mut self.pending),
            ..RankPatch::default()
        };
        self.in_flight = Some(patch.clone());
        Some(patch)
    }

    /// Folds the in-flight write into the persisted order. Ranks changed again
    /// while the write was in flight stay pending.
    pub fn ack_write(&mut self, seq: WriteSeq) {
        let Some(patch) = self.in_flight.take() else {
            return;
        };
        self.persisted.apply_patch(&patch, seq);
        self.settle();
    }

    /// The write failed for good. Local order is kept and the ranks go back to
    /// pending for an explicit retry.
    pub fn fail_write(&mut self) {
        if let Some(patch) = self.in_flight.take() {
            for (id, rank) in patch.upserts {
                self.pending.entry(id).or_insert(rank);
            }
        }
        self.settle();
    }

    pub fn discard_pending(&mut self) {
        self.pending.clear();
        if self.dragging.is_none() {
            self.materialize();
        }
    }

    pub fn append_patch(&self, id: &EntryId) -> Result<RankPatch, ReconcileError> {
        if let Some(dragged) = &self.dragging {
            return Err(ReconcileError::DragInProgress(dragged.clone()));
        }
        if self.contains(id) {
            return Err(ReconcileError::DuplicateEntry(id.clone()));
        }
        let next = self
            .sequence
            .iter()
            .map(|entry| entry.rank)
            .chain(self.persisted.max_rank())
            .max()
            .map_or(0, |rank| rank + 1);
        Ok(RankPatch::upsert(id.clone(), next))
    }

    pub fn removal_patch(&self, id: &EntryId) -> Result<RankPatch, ReconcileError> {
        if let Some(dragged) = &self.dragging {
            return Err(ReconcileError::DragInProgress(dragged.clone()));
        }
        if !self.contains(id) {
            return Err(ReconcileError::StaleReference(id.clone()));
        }
        Ok(RankPatch::removal(id.clone()))
    }

    /// Folds an acknowledged add or remove into the persisted order.
    pub fn apply_committed(&mut self, patch: &RankPatch, seq: WriteSeq) {
        self.persisted.apply_patch(patch, seq);
        for id in &patch.removals {
            self.pending.remove(id);
        }
        if self.dragging.is_none() {
            self.materialize();
        }
    }

    fn absorb(&mut self, remote: &OrderMap) {
        self.persisted.join(remote);
        let persisted = &self.persisted;
        self.pending
            .retain(|id, rank| persisted.rank(id).is_some_and(|current| current != *rank));
    }

    /// Applies deferred remote updates once nothing is holding them back.
    fn settle(&mut self) {
        if self.dragging.is_some() {
            return;
        }
        if self.in_flight.is_none() {
            if let Some(remote) = self.deferred.take() {
                self.absorb(&remote);
            }
        }
        self.materialize();
    }

    fn materialize(&mut self) {
        let mut sequence: Vec<Entry> = self
            .persisted
            .live()
            .map(|(id, rank)| Entry {
                id: id.clone(),
                rank: self.display_rank(id, rank),
            })
            .collect();
        sequence.sort_by(compare_entries);
        self.sequence = sequence;
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
