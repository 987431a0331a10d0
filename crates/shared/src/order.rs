//! Persisted order of a log: entry id -> rank, with per-entry write stamps so
//! snapshots from different collaborators merge deterministically.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use serde::{Deserialize, Serialize};

use crate::domain::{CollaboratorId, Entry, EntryId, Rank, WriteSeq};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RankSlot {
    Live { rank: Rank, seq: WriteSeq },
    Removed { seq: WriteSeq },
}

impl RankSlot {
    pub fn seq(&self) -> WriteSeq {
        match self {
            Self::Live { seq, .. } | Self::Removed { seq } => *seq,
        }
    }

    pub fn rank(&self) -> Option<Rank> {
        match self {
            Self::Live { rank, .. } => Some(*rank),
            Self::Removed { .. } => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Last write wins; at the same write a tombstone beats a live slot, and
    /// between two live slots the higher rank wins.
    fn precedence(&self) -> (WriteSeq, u8, Rank) {
        match self {
            Self::Live { rank, seq } => (*seq, 0, *rank),
            Self::Removed { seq } => (*seq, 1, Rank::MIN),
        }
    }

    pub fn newer(self, other: Self) -> Self {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

/// Changed subset of an order, written to the store as one logical write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankPatch {
    #[serde(default)]
    pub upserts: BTreeMap<EntryId, Rank>,
    #[serde(default)]
    pub removals: BTreeSet<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<CollaboratorId>,
}

impl RankPatch {
    pub fn upsert(id: EntryId, rank: Rank) -> Self {
        let mut patch = Self::default();
        patch.upserts.insert(id, rank);
        patch
    }

    pub fn removal(id: EntryId) -> Self {
        let mut patch = Self::default();
        patch.removals.insert(id);
        patch
    }

    pub fn with_author(mut self, author: Option<CollaboratorId>) -> Self {
        self.author = author;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMap {
    seq: WriteSeq,
    slots: BTreeMap<EntryId, RankSlot>,
}

impl OrderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map whose entries were all written at `seq`.
    pub fn from_ranks<I, K>(ranks: I, seq: WriteSeq) -> Self
    where
        I: IntoIterator<Item = (K, Rank)>,
        K: Into<EntryId>,
    {
        let slots = ranks
            .into_iter()
            .map(|(id, rank)| (id.into(), RankSlot::Live { rank, seq }))
            .collect();
        Self { seq, slots }
    }

    pub fn from_slots<I>(slots: I, seq: WriteSeq) -> Self
    where
        I: IntoIterator<Item = (EntryId, RankSlot)>,
    {
        let mut map = Self {
            seq,
            slots: BTreeMap::new(),
        };
        for (id, slot) in slots {
            map.merge_slot(id, slot);
        }
        map
    }

    pub fn seq(&self) -> WriteSeq {
        self.seq
    }

    pub fn slots(&self) -> &BTreeMap<EntryId, RankSlot> {
        &self.slots
    }

    pub fn slot(&self, id: &EntryId) -> Option<RankSlot> {
        self.slots.get(id).copied()
    }

    pub fn rank(&self, id: &EntryId) -> Option<Rank> {
        self.slots.get(id).and_then(RankSlot::rank)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.rank(id).is_some()
    }

    pub fn live(&self) -> impl Iterator<Item = (&EntryId, Rank)> + '_ {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.rank().map(|rank| (id, rank)))
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.live().next().is_none()
    }

    pub fn max_rank(&self) -> Option<Rank> {
        self.live().map(|(_, rank)| rank).max()
    }

    /// Live entries sorted by rank, ties broken by id.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .live()
            .map(|(id, rank)| Entry {
                id: id.clone(),
                rank,
            })
            .collect();
        entries.sort_by(compare_entries);
        entries
    }

    pub fn sorted_ids(&self) -> Vec<EntryId> {
        self.entries().into_iter().map(|entry| entry.id).collect()
    }

    /// Folds a single slot in, keeping whichever write is newer.
    pub fn merge_slot(&mut self, id: EntryId, slot: RankSlot) {
        self.seq = self.seq.max(slot.seq());
        self.slots
            .entry(id)
            .and_modify(|current| *current = current.newer(slot))
            .or_insert(slot);
    }

    /// Deterministic merge of two snapshots of the same log. Commutative,
    /// associative and idempotent.
    pub fn join(&mut self, other: &OrderMap) {
        for (id, slot) in &other.slots {
            self.merge_slot(id.clone(), *slot);
        }
        self.seq = self.seq.max(other.seq);
    }

    pub fn joined(mut self, other: &OrderMap) -> Self {
        self.join(other);
        self
    }

    /// Stamps a committed patch with its write sequence and folds it in.
    pub fn apply_patch(&mut self, patch: &RankPatch, seq: WriteSeq) {
        for (id, rank) in &patch.upserts {
            self.merge_slot(id.clone(), RankSlot::Live { rank: *rank, seq });
        }
        for id in &patch.removals {
            self.merge_slot(id.clone(), RankSlot::Removed { seq });
        }
        self.seq = self.seq.max(seq);
    }
}

impl OrderMap {
    /// Patch that turns `self` into `next` when written with `set`: every live
    /// entry of `next` is rewritten, entries missing from it are removed.
    pub fn replacement_patch(&self, next: &OrderMap) -> RankPatch {
        let upserts: BTreeMap<EntryId, Rank> = next
            .live()
            .map(|(id, rank)| (id.clone(), rank))
            .collect();
        let removals = self
            .live()
            .filter(|(id, _)| !upserts.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        RankPatch {
            upserts,
            removals,
            author: None,
        }
    }
}

pub fn compare_entries(a: &Entry, b: &Entry) -> Ordering {
    a.rank.cmp(&b.rank).then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
#[path = "tests/order_tests.rs"]
mod tests;
