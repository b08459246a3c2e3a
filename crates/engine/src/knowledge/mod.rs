//! Knowledge base store: runbook records, loader, and the related-entry
//! graph.
//!
//! The store is read-only to the rest of the engine. Entries are validated
//! once at load; anything malformed is excluded and reported, never
//! silently ignored. Related-entry references are resolved into an index
//! arena so graph traversal is bounds-checked array walking, not id chasing.

mod loader;
mod types;

pub use loader::{load_dir, load_entries, ExcludedEntry, LoadReport};
pub use types::{
    Cause, ExpectedSignal, Probe, RemediationAction, RiskClass, RunbookEntry, StructuredSignal,
};

use std::collections::HashMap;

/// The loaded, validated knowledge base.
///
/// Entries live in an arena indexed by slot; `related` links are resolved
/// to slots at construction so navigation never dereferences an id that
/// does not exist.
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    entries: Vec<RunbookEntry>,
    index: HashMap<String, usize>,
    neighbors: Vec<Vec<usize>>,
}

impl KnowledgeBase {
    /// Build from validated entries. Dangling `related` ids must already
    /// have been excluded by the loader; any that remain are dropped.
    #[must_use]
    pub(crate) fn from_entries(entries: Vec<RunbookEntry>) -> Self {
        let index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.id.clone(), slot))
            .collect();

        let neighbors = entries
            .iter()
            .map(|e| {
                e.related
                    .iter()
                    .filter_map(|id| index.get(id).copied())
                    .collect()
            })
            .collect();

        Self {
            entries,
            index,
            neighbors,
        }
    }

    /// All loaded entries, in arena order.
    #[must_use]
    pub fn entries(&self) -> &[RunbookEntry] {
        &self.entries
    }

    /// Number of loaded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the knowledge base holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arena slot for an entry id.
    #[must_use]
    pub fn slot(&self, entry_id: &str) -> Option<usize> {
        self.index.get(entry_id).copied()
    }

    /// Entry at an arena slot.
    #[must_use]
    pub fn entry_at(&self, slot: usize) -> &RunbookEntry {
        &self.entries[slot]
    }

    /// Entry by id.
    #[must_use]
    pub fn get(&self, entry_id: &str) -> Option<&RunbookEntry> {
        self.slot(entry_id).map(|slot| &self.entries[slot])
    }

    /// Resolved related-entry slots for the entry at `slot`.
    #[must_use]
    pub fn neighbors(&self, slot: usize) -> &[usize] {
        &self.neighbors[slot]
    }
}
