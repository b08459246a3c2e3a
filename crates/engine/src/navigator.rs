//! Runbook graph navigation.
//!
//! The `related` links between entries form a directed, generally cyclic
//! graph. When every cause of the active entry has been refuted, the
//! navigator picks the best unvisited neighbor; the per-session visited
//! set makes the walk finite (at most one evaluation per graph node),
//! with no recursion anywhere.

use serde::Serialize;
use serde_json::Value;

use crate::config::MatcherWeights;
use crate::knowledge::KnowledgeBase;
use crate::matcher::{self, SymptomSet};
use crate::ranker::HypothesisState;

/// The next entry to diagnose, chosen from the current entry's neighbors.
#[derive(Debug, Clone)]
pub struct NextEntry {
    /// Arena slot of the chosen entry
    pub slot: usize,
    /// Entry id
    pub entry_id: String,
    /// Residual symptom match score that ranked it first
    pub score: f64,
}

/// Pick the best unvisited neighbor of `current_slot`, ranked by symptom
/// overlap (the matcher's scoring, restricted to the neighbor set).
///
/// Returns `None` when every neighbor has been visited or none matches
/// the symptoms; the caller escalates with a partial diagnosis.
#[must_use]
pub fn next_entry(
    kb: &KnowledgeBase,
    current_slot: usize,
    visited: &[String],
    symptoms: &SymptomSet,
    weights: &MatcherWeights,
) -> Option<NextEntry> {
    let candidates: Vec<usize> = kb
        .neighbors(current_slot)
        .iter()
        .copied()
        .filter(|&slot| {
            let id = &kb.entry_at(slot).id;
            !visited.iter().any(|v| v == id)
        })
        .collect();

    let ranked = matcher::rank_slots(kb, candidates, symptoms, weights);
    ranked.first().map(|best| NextEntry {
        slot: best.slot,
        entry_id: best.entry_id.clone(),
        score: best.score,
    })
}

/// Partial-diagnosis report attached to the audit log when the graph is
/// exhausted without a confirmed hypothesis.
#[derive(Debug, Clone, Serialize)]
pub struct PartialDiagnosis {
    /// Entries evaluated, in visit order
    pub visited: Vec<String>,
    /// Final belief snapshot over the last entry's causes
    pub beliefs: Vec<HypothesisState>,
    /// Number of evidence records accumulated
    pub evidence_count: usize,
}

impl PartialDiagnosis {
    /// Serialize for embedding in an audit record detail.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
