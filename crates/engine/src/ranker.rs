//! Hypothesis ranking: belief scores over the active entry's causes.
//!
//! Beliefs start from declared priors (uniform when absent) and move with
//! a multiplicative Bayesian-style update per evidence arrival, then
//! renormalize over the still-active causes. Crossing the confirmation
//! threshold promotes a cause; falling under the floor refutes it.
//! Refuted causes leave the normalization set but stay visible in the
//! session snapshot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LikelihoodConfig;
use crate::knowledge::Cause;
use crate::session::EvidenceOutcome;

/// Lifecycle of a single hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    /// Still in play
    Pending,
    /// Belief crossed the confirmation threshold
    Confirmed,
    /// Belief fell below the refutation floor
    Refuted,
}

/// Belief state for one cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisState {
    /// Cause id within the active entry
    pub cause_id: String,
    /// Current belief in [0, 1]; frozen at its last value once Refuted
    pub belief: f64,
    /// Lifecycle status
    pub status: HypothesisStatus,
}

/// What an evidence update meant for the table as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankerSignal {
    /// Beliefs moved; diagnosis continues
    Updated,
    /// A cause crossed the confirmation threshold
    Confirmed {
        /// The confirmed cause
        cause_id: String,
    },
    /// Every cause is refuted; the navigator takes over
    Exhausted,
}

/// Belief table over the active runbook entry's causes.
#[derive(Debug, Clone)]
pub struct BeliefTable {
    hypotheses: Vec<HypothesisState>,
    confirmation_threshold: f64,
    refutation_floor: f64,
}

impl BeliefTable {
    /// Initialize beliefs for an entry's causes.
    ///
    /// Declared priors are normalized across the entry; causes without one
    /// get the mean of the declared priors. With no priors at all the
    /// distribution is uniform.
    #[must_use]
    pub fn new(causes: &[Cause], confirmation_threshold: f64, refutation_floor: f64) -> Self {
        let declared: Vec<f64> = causes.iter().filter_map(|c| c.prior).collect();
        let fill = if declared.is_empty() {
            1.0
        } else {
            declared.iter().sum::<f64>() / declared.len() as f64
        };

        let mut hypotheses: Vec<HypothesisState> = causes
            .iter()
            .map(|c| HypothesisState {
                cause_id: c.id.clone(),
                belief: c.prior.unwrap_or(fill),
                status: HypothesisStatus::Pending,
            })
            .collect();

        let total: f64 = hypotheses.iter().map(|h| h.belief).sum();
        if total > 0.0 {
            for h in &mut hypotheses {
                h.belief /= total;
            }
        }

        Self {
            hypotheses,
            confirmation_threshold,
            refutation_floor,
        }
    }

    /// Apply one evidence outcome to the cause it was probing.
    pub fn observe(
        &mut self,
        cause_id: &str,
        outcome: EvidenceOutcome,
        likelihood: &LikelihoodConfig,
    ) -> RankerSignal {
        let multiplier = match outcome {
            EvidenceOutcome::Pass => likelihood.pass,
            EvidenceOutcome::Fail => likelihood.fail,
            EvidenceOutcome::Inconclusive => likelihood.inconclusive,
        };

        let Some(hyp) = self
            .hypotheses
            .iter_mut()
            .find(|h| h.cause_id == cause_id && h.status == HypothesisStatus::Pending)
        else {
            // Evidence for a cause no longer in play (late probe result
            // after refutation, or a stale entry). Nothing to update.
            return self.current_signal();
        };

        hyp.belief *= multiplier;
        debug!(cause_id, ?outcome, multiplier, "belief updated");

        self.normalize();
        self.sweep_refutations();
        self.promote_confirmed();
        self.current_signal()
    }

    /// The confirmed hypothesis, if any.
    #[must_use]
    pub fn confirmed(&self) -> Option<&HypothesisState> {
        self.hypotheses
            .iter()
            .find(|h| h.status == HypothesisStatus::Confirmed)
    }

    /// Whether every cause has been refuted.
    #[must_use]
    pub fn all_refuted(&self) -> bool {
        !self.hypotheses.is_empty()
            && self
                .hypotheses
                .iter()
                .all(|h| h.status == HypothesisStatus::Refuted)
    }

    /// Current state of one hypothesis.
    #[must_use]
    pub fn get(&self, cause_id: &str) -> Option<&HypothesisState> {
        self.hypotheses.iter().find(|h| h.cause_id == cause_id)
    }

    /// Snapshot of the whole table for the session state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HypothesisState> {
        self.hypotheses.clone()
    }

    fn active(&self) -> impl Iterator<Item = &HypothesisState> {
        self.hypotheses
            .iter()
            .filter(|h| h.status != HypothesisStatus::Refuted)
    }

    fn normalize(&mut self) {
        let total: f64 = self.active().map(|h| h.belief).sum();
        if total > 0.0 {
            for h in &mut self.hypotheses {
                if h.status != HypothesisStatus::Refuted {
                    h.belief /= total;
                }
            }
        }
    }

    fn sweep_refutations(&mut self) {
        loop {
            let active: Vec<usize> = self
                .hypotheses
                .iter()
                .enumerate()
                .filter(|(_, h)| h.status != HypothesisStatus::Refuted)
                .map(|(i, _)| i)
                .collect();
            if active.is_empty() {
                return;
            }

            let total: f64 = active.iter().map(|&i| self.hypotheses[i].belief).sum();
            let below: Vec<usize> = active
                .iter()
                .copied()
                .filter(|&i| total <= 0.0 || self.hypotheses[i].belief < self.refutation_floor)
                .collect();
            if below.is_empty() {
                return;
            }

            // Refuting everything at once means the entry is exhausted;
            // renormalizing an empty set is meaningless.
            for &i in &below {
                self.hypotheses[i].status = HypothesisStatus::Refuted;
                debug!(cause_id = %self.hypotheses[i].cause_id, "hypothesis refuted");
            }
            self.normalize();
        }
    }

    fn promote_confirmed(&mut self) {
        if self.confirmed().is_some() {
            return;
        }
        if let Some(hyp) = self.hypotheses.iter_mut().find(|h| {
            h.status == HypothesisStatus::Pending && h.belief >= self.confirmation_threshold
        }) {
            hyp.status = HypothesisStatus::Confirmed;
            debug!(cause_id = %hyp.cause_id, belief = hyp.belief, "hypothesis confirmed");
        }
    }

    fn current_signal(&self) -> RankerSignal {
        if let Some(confirmed) = self.confirmed() {
            return RankerSignal::Confirmed {
                cause_id: confirmed.cause_id.clone(),
            };
        }
        if self.all_refuted() {
            return RankerSignal::Exhausted;
        }
        RankerSignal::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cause(id: &str, prior: Option<f64>) -> Cause {
        Cause {
            id: id.to_string(),
            summary: String::new(),
            prior,
            probes: Vec::new(),
            actions: Vec::new(),
        }
    }

    fn active_sum(table: &BeliefTable) -> f64 {
        table
            .snapshot()
            .iter()
            .filter(|h| h.status != HypothesisStatus::Refuted)
            .map(|h| h.belief)
            .sum()
    }

    #[test]
    fn test_uniform_prior_without_declarations() {
        let table = BeliefTable::new(
            &[cause("a", None), cause("b", None), cause("c", None)],
            0.7,
            0.05,
        );
        for h in table.snapshot() {
            assert!((h.belief - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_declared_priors_normalized_with_mean_fill() {
        let table = BeliefTable::new(
            &[cause("a", Some(0.6)), cause("b", Some(0.2)), cause("c", None)],
            0.7,
            0.05,
        );
        // c is filled with mean(0.6, 0.2) = 0.4; total 1.2.
        let snapshot = table.snapshot();
        assert!((snapshot[0].belief - 0.5).abs() < 1e-9);
        assert!((snapshot[1].belief - 0.2 / 1.2).abs() < 1e-9);
        assert!((snapshot[2].belief - 0.4 / 1.2).abs() < 1e-9);
        assert!((active_sum(&table) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pass_evidence_confirms_above_threshold() {
        let mut table = BeliefTable::new(&[cause("db", None), cause("net", None)], 0.7, 0.05);
        let likelihood = LikelihoodConfig::default();

        let signal = table.observe("db", EvidenceOutcome::Pass, &likelihood);
        // 0.5*3 vs 0.5 → 0.75 ≥ 0.7.
        assert_eq!(
            signal,
            RankerSignal::Confirmed {
                cause_id: "db".to_string()
            }
        );
        assert_eq!(table.confirmed().unwrap().cause_id, "db");
    }

    #[test]
    fn test_beliefs_sum_to_one_after_every_update() {
        let mut table = BeliefTable::new(
            &[cause("a", None), cause("b", None), cause("c", None)],
            0.99,
            0.01,
        );
        let likelihood = LikelihoodConfig::default();
        let outcomes = [
            ("a", EvidenceOutcome::Pass),
            ("b", EvidenceOutcome::Fail),
            ("c", EvidenceOutcome::Inconclusive),
            ("a", EvidenceOutcome::Fail),
            ("b", EvidenceOutcome::Pass),
        ];
        for (cause_id, outcome) in outcomes {
            table.observe(cause_id, outcome, &likelihood);
            assert!((active_sum(&table) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fail_evidence_refutes_below_floor() {
        let mut table = BeliefTable::new(&[cause("a", None), cause("b", None)], 0.95, 0.05);
        let likelihood = LikelihoodConfig::default();

        // Repeated misses drive a under the floor: 0.2 each update.
        table.observe("a", EvidenceOutcome::Fail, &likelihood);
        let signal = table.observe("a", EvidenceOutcome::Fail, &likelihood);

        let a = table.get("a").unwrap();
        assert_eq!(a.status, HypothesisStatus::Refuted);
        // The surviving cause takes the full mass and crosses the
        // threshold on its own.
        assert_eq!(
            signal,
            RankerSignal::Confirmed {
                cause_id: "b".to_string()
            }
        );
    }

    #[test]
    fn test_all_refuted_signals_exhausted() {
        let mut table = BeliefTable::new(&[cause("a", None), cause("b", None)], 2.0, 0.45);
        let likelihood = LikelihoodConfig::default();

        // The first fail drops a below the 0.45 floor. b then holds the
        // full mass and renormalization pins it at 1.0, so only a zero
        // multiplier can take the last active cause out.
        table.observe("a", EvidenceOutcome::Fail, &likelihood);
        assert_eq!(table.get("a").unwrap().status, HypothesisStatus::Refuted);

        let zeroed = LikelihoodConfig {
            fail: 0.0,
            ..LikelihoodConfig::default()
        };
        let signal = table.observe("b", EvidenceOutcome::Fail, &zeroed);
        assert_eq!(signal, RankerSignal::Exhausted);
        assert!(table.all_refuted());
    }

    #[test]
    fn test_refuted_causes_keep_last_belief_in_snapshot() {
        let mut table = BeliefTable::new(&[cause("a", None), cause("b", None)], 0.99, 0.3);
        table.observe("a", EvidenceOutcome::Fail, &LikelihoodConfig::default());

        let snapshot = table.snapshot();
        let a = snapshot.iter().find(|h| h.cause_id == "a").unwrap();
        assert_eq!(a.status, HypothesisStatus::Refuted);
        assert!(a.belief > 0.0, "refuted belief stays in the log");
    }
}
