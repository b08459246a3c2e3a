//! Symptom matching.
//!
//! Scoring is a pure function of the symptom set and the entry (no
//! string similarity, no hidden state), so the same observed symptoms
//! always produce the same ranking and audit results stay reproducible.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::MatcherWeights;
use crate::knowledge::{KnowledgeBase, RunbookEntry, StructuredSignal};

/// Observed symptoms for an incident: free-form tags plus structured
/// signal descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymptomSet {
    /// Free-form tags, matched verbatim against entry symptom tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Structured signals, matched field-and-value exact
    #[serde(default)]
    pub signals: Vec<StructuredSignal>,
}

impl SymptomSet {
    /// Whether the caller observed nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.signals.is_empty()
    }
}

/// A scored match against one entry.
#[derive(Debug, Clone, Serialize)]
pub struct MatchScore {
    /// Matched entry id
    pub entry_id: String,
    /// Arena slot of the entry
    pub slot: usize,
    /// Match score in [0, 1]
    pub score: f64,
}

/// Score one entry against the observed symptoms.
///
/// `score = (w_tag * tag_hits + w_sig * signal_hits) /
///          (w_tag * entry_tags + w_sig * entry_signals)`
///
/// The denominator is the entry's own signal budget, so an entry partially
/// matched ranks below one fully matched.
#[must_use]
pub fn score_entry(entry: &RunbookEntry, symptoms: &SymptomSet, weights: &MatcherWeights) -> f64 {
    let denominator = weights.tag_weight * entry.symptoms.len() as f64
        + weights.signal_weight * entry.signals.len() as f64;
    if denominator <= 0.0 {
        return 0.0;
    }

    let observed_tags: HashSet<&str> = symptoms.tags.iter().map(String::as_str).collect();
    let tag_hits = entry
        .symptoms
        .iter()
        .filter(|tag| observed_tags.contains(tag.as_str()))
        .count();

    let signal_hits = entry
        .signals
        .iter()
        .filter(|sig| symptoms.signals.iter().any(|o| o == *sig))
        .count();

    (weights.tag_weight * tag_hits as f64 + weights.signal_weight * signal_hits as f64)
        / denominator
}

/// Rank every knowledge base entry against the observed symptoms.
///
/// Entries with zero score are dropped. Ties break by entry id so the
/// ranking is fully deterministic. An empty symptom set yields an empty
/// ranking, never an error.
#[must_use]
pub fn rank(kb: &KnowledgeBase, symptoms: &SymptomSet, weights: &MatcherWeights) -> Vec<MatchScore> {
    rank_slots(kb, 0..kb.len(), symptoms, weights)
}

/// Rank a subset of entries (by arena slot) against the observed symptoms.
///
/// The navigator uses this to score just the unvisited neighbors of the
/// current entry.
#[must_use]
pub fn rank_slots(
    kb: &KnowledgeBase,
    slots: impl IntoIterator<Item = usize>,
    symptoms: &SymptomSet,
    weights: &MatcherWeights,
) -> Vec<MatchScore> {
    if symptoms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<MatchScore> = slots
        .into_iter()
        .map(|slot| {
            let entry = kb.entry_at(slot);
            MatchScore {
                entry_id: entry.id.clone(),
                slot,
                score: score_entry(entry, symptoms, weights),
            }
        })
        .filter(|m| m.score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
    scored
}
