// ==============================================================================
// index.rs - Variant Deduplication Index
// ==============================================================================
// Description: In-memory map from variant identity to stored variant id
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// The index is not synchronized. It is owned by the single thread that
// consumes the ordered record stream, which serializes every mutation.
// ==============================================================================

use std::collections::HashMap;

use crate::models::{VariantId, VariantIdentity};

/// Whether an entry was inserted by the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Novelty {
    /// Loaded from the backing store
    Seen,
    /// Inserted during this run
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub stored_id: VariantId,
    pub novelty: Novelty,
}

#[derive(Debug, Default)]
pub struct VariantIndex {
    entries: HashMap<VariantIdentity, IndexEntry>,
    next_id: VariantId,
    /// Attribute updates not yet persisted, last writer wins
    pending_updates: HashMap<VariantId, Vec<Option<String>>>,
    new_count: usize,
}

impl VariantIndex {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Build an index from identities already in the backing store
    pub fn from_stored<I>(stored: I) -> Self
    where
        I: IntoIterator<Item = (VariantIdentity, VariantId)>,
    {
        let mut index = Self::new();
        for (identity, id) in stored {
            index.next_id = index.next_id.max(id + 1);
            index.entries.entry(identity).or_insert(IndexEntry {
                stored_id: id,
                novelty: Novelty::Seen,
            });
        }
        index
    }

    pub fn lookup(&self, identity: &VariantIdentity) -> Option<IndexEntry> {
        self.entries.get(identity).copied()
    }

    /// Insert an identity and return its stored id
    ///
    /// An identity that is already present keeps its original id.
    pub fn insert(&mut self, identity: VariantIdentity) -> VariantId {
        if let Some(entry) = self.entries.get(&identity) {
            return entry.stored_id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.new_count += 1;
        self.entries.insert(
            identity,
            IndexEntry {
                stored_id: id,
                novelty: Novelty::New,
            },
        );
        id
    }

    /// Record new non-key attributes for a stored variant
    pub fn update_attributes(&mut self, stored_id: VariantId, attrs: Vec<Option<String>>) {
        self.pending_updates.insert(stored_id, attrs);
    }

    /// Drain attribute updates for persistence, ordered by id
    pub fn take_pending_updates(&mut self) -> Vec<(VariantId, Vec<Option<String>>)> {
        let mut updates: Vec<_> = self.pending_updates.drain().collect();
        updates.sort_by_key(|(id, _)| *id);
        updates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries inserted by this run
    pub fn new_count(&self) -> usize {
        self.new_count
    }

    pub fn next_id(&self) -> VariantId {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(chr: &str, pos: u64, r: &str, a: &str) -> VariantIdentity {
        VariantIdentity::new(chr, pos, r, a)
    }

    #[test]
    fn test_insert_then_lookup() {
        let mut index = VariantIndex::new();
        assert!(index.lookup(&v("1", 100, "A", "G")).is_none());
        let id = index.insert(v("1", 100, "A", "G"));
        assert_eq!(id, 1);
        let entry = index.lookup(&v("1", 100, "A", "G")).unwrap();
        assert_eq!(entry.stored_id, 1);
        assert_eq!(entry.novelty, Novelty::New);
    }

    #[test]
    fn test_position_is_part_of_identity() {
        let mut index = VariantIndex::new();
        let a = index.insert(v("1", 100, "A", "G"));
        let b = index.insert(v("1", 101, "A", "G"));
        assert_ne!(a, b);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_first_writer_wins_for_id() {
        let mut index = VariantIndex::new();
        let first = index.insert(v("X", 5, "C", "T"));
        let again = index.insert(v("X", 5, "C", "T"));
        assert_eq!(first, again);
        assert_eq!(index.new_count(), 1);
    }

    #[test]
    fn test_loaded_entries_are_seen_and_ids_continue() {
        let index = VariantIndex::from_stored(vec![(v("1", 1, "A", "C"), 7), (v("1", 2, "A", "C"), 3)]);
        assert_eq!(index.lookup(&v("1", 1, "A", "C")).unwrap().novelty, Novelty::Seen);
        assert_eq!(index.next_id(), 8);
        assert_eq!(index.new_count(), 0);
    }

    #[test]
    fn test_last_writer_wins_for_attributes() {
        let mut index = VariantIndex::new();
        let id = index.insert(v("2", 9, "G", "A"));
        index.update_attributes(id, vec![Some("10".into())]);
        index.update_attributes(id, vec![Some("20".into())]);
        let updates = index.take_pending_updates();
        assert_eq!(updates, vec![(id, vec![Some("20".to_string())])]);
        assert!(index.take_pending_updates().is_empty());
    }
}
