//! Per-session driver task.
//!
//! One driver owns all writes to its session's hypothesis state, evidence
//! log, action log, and status. Probe results and operator commands
//! arrive on queues and are consumed serially, so session state needs no
//! locking beyond the published snapshot. The remediation half of the
//! state machine lives in [`crate::orchestrator`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::executor::ProbeRunner;
use crate::knowledge::{KnowledgeBase, RunbookEntry};
use crate::matcher;
use crate::navigator::{self, PartialDiagnosis};
use crate::ranker::{BeliefTable, HypothesisStatus, RankerSignal};
use crate::session::{Actor, Evidence, Session, SessionStatus};

/// Operator commands posted to a session driver.
pub(crate) enum SessionCommand {
    /// Approve the pending action
    Approve {
        /// Action the approval targets
        action_id: String,
        /// Approving operator
        actor: Actor,
        /// Outcome: `Ok` when the approval matched the pending action
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Cancel the session at the next checkpoint
    Cancel {
        /// Cancelling operator
        actor: Actor,
    },
}

/// What diagnosing one entry concluded.
pub(crate) enum DiagnoseOutcome {
    /// A cause crossed the confirmation threshold
    Confirmed {
        /// The confirmed cause
        cause_id: String,
        /// Evidence log index of the confirming observation
        evidence_ref: usize,
        /// Probe that produced the confirming observation
        probe_id: String,
    },
    /// Every cause was refuted; consult the navigator
    Exhausted,
    /// The session reached a terminal status while diagnosing
    Terminal,
}

enum Wake {
    Evidence(Option<Evidence>),
    Command(Option<SessionCommand>),
    Deadline,
}

pub(crate) struct SessionDriver {
    pub(crate) kb: Arc<KnowledgeBase>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) runner: Arc<ProbeRunner>,
    pub(crate) session: Session,
    pub(crate) shared: Arc<RwLock<Session>>,
    pub(crate) commands: mpsc::Receiver<SessionCommand>,
    pub(crate) commands_open: bool,
    pub(crate) evidence_tx: mpsc::Sender<Evidence>,
    pub(crate) evidence_rx: mpsc::Receiver<Evidence>,
    pub(crate) deadline: tokio::time::Instant,
    pub(crate) vars: serde_json::Value,
}

impl SessionDriver {
    pub(crate) fn new(
        kb: Arc<KnowledgeBase>,
        config: Arc<EngineConfig>,
        runner: Arc<ProbeRunner>,
        session: Session,
        shared: Arc<RwLock<Session>>,
        commands: mpsc::Receiver<SessionCommand>,
        vars: serde_json::Value,
    ) -> Self {
        let (evidence_tx, evidence_rx) = mpsc::channel(64);
        let deadline = tokio::time::Instant::now() + config.session_ttl();
        Self {
            kb,
            config,
            runner,
            session,
            shared,
            commands,
            commands_open: true,
            evidence_tx,
            evidence_rx,
            deadline,
            vars,
        }
    }

    /// Drive the session to a terminal status and return the final state.
    pub(crate) async fn run(mut self) -> Session {
        let ranked = matcher::rank(&self.kb, &self.session.symptoms, &self.config.matcher);
        let Some(first) = ranked.first().map(|m| (m.slot, m.entry_id.clone(), m.score)) else {
            self.session.transition(
                SessionStatus::Escalated,
                Actor::Automated,
                "no runbook entry matches the observed symptoms",
                None,
                None,
            );
            self.publish().await;
            return self.session;
        };

        info!(
            session_id = %self.session.id,
            entry_id = %first.1,
            score = first.2,
            "symptoms matched"
        );

        let mut slot = first.0;
        loop {
            let entry = self.kb.entry_at(slot).clone();
            // Into the visited set before evaluation: the walk must be
            // finite even on a cyclic graph.
            self.session.visit(&entry.id);
            self.publish().await;

            match self.diagnose_entry(&entry).await {
                DiagnoseOutcome::Confirmed {
                    cause_id,
                    evidence_ref,
                    probe_id,
                } => {
                    self.remediate(&entry, &cause_id, evidence_ref, &probe_id)
                        .await;
                    break;
                }
                DiagnoseOutcome::Terminal => break,
                DiagnoseOutcome::Exhausted => {
                    match navigator::next_entry(
                        &self.kb,
                        slot,
                        &self.session.visited,
                        &self.session.symptoms,
                        &self.config.matcher,
                    ) {
                        Some(next) => {
                            self.session.transition(
                                SessionStatus::Diagnosing,
                                Actor::Automated,
                                format!(
                                    "all causes refuted; following related entry {} (score {:.2})",
                                    next.entry_id, next.score
                                ),
                                None,
                                None,
                            );
                            self.publish().await;
                            slot = next.slot;
                        }
                        None => {
                            self.escalate_partial(
                                "related-runbook graph exhausted without a confirmed hypothesis",
                            )
                            .await;
                            break;
                        }
                    }
                }
            }
        }

        self.publish().await;
        self.session
    }

    /// Run the active entry's probes, feeding evidence into the belief
    /// table, until a cause confirms, everything refutes, or the session
    /// ends.
    async fn diagnose_entry(&mut self, entry: &RunbookEntry) -> DiagnoseOutcome {
        let mut table = BeliefTable::new(
            &entry.causes,
            self.config.confirmation_threshold,
            self.config.refutation_floor,
        );
        self.session.hypotheses = table.snapshot();
        self.publish().await;

        // Late results from a previous entry are still observations worth
        // logging, but they must not feed this entry's belief table.
        while let Ok(evidence) = self.evidence_rx.try_recv() {
            self.session.append_evidence(evidence);
        }

        let mut cursors: HashMap<String, usize> = HashMap::new();
        let mut inflight: HashSet<String> = HashSet::new();

        loop {
            // One probe per active cause at a time; independent causes
            // probe concurrently under the shared worker pool.
            for cause in &entry.causes {
                let pending = table
                    .get(&cause.id)
                    .is_some_and(|h| h.status == HypothesisStatus::Pending);
                if !pending || inflight.contains(&cause.id) {
                    continue;
                }
                let cursor = *cursors.get(&cause.id).unwrap_or(&0);
                let Some(probe) = cause.probes.get(cursor) else {
                    continue;
                };
                cursors.insert(cause.id.clone(), cursor + 1);
                inflight.insert(cause.id.clone());

                debug!(
                    session_id = %self.session.id,
                    cause_id = %cause.id,
                    probe_id = %probe.id,
                    "scheduling probe"
                );
                let runner = Arc::clone(&self.runner);
                let tx = self.evidence_tx.clone();
                let probe = probe.clone();
                let cause_id = cause.id.clone();
                let vars = self.vars.clone();
                tokio::spawn(async move {
                    let evidence = runner.run_probe(&probe, &cause_id, &vars).await;
                    let _ = tx.send(evidence).await;
                });
            }

            if inflight.is_empty() {
                if table.all_refuted() {
                    return DiagnoseOutcome::Exhausted;
                }
                // Out of probes with no verdict either way.
                self.session.hypotheses = table.snapshot();
                self.escalate_partial("diagnostic probes exhausted without a confirmed hypothesis")
                    .await;
                return DiagnoseOutcome::Terminal;
            }

            let wake = tokio::select! {
                evidence = self.evidence_rx.recv() => Wake::Evidence(evidence),
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                () = tokio::time::sleep_until(self.deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Evidence(Some(evidence)) => {
                    let outcome = evidence.outcome;
                    let probe_id = evidence.probe_id.clone();
                    let cause_id = evidence.cause_id.clone();
                    let evidence_ref = self.session.append_evidence(evidence);
                    if entry.cause(&cause_id).is_none() {
                        // A straggler from an entry we already left.
                        continue;
                    }
                    inflight.remove(&cause_id);
                    let signal = table.observe(&cause_id, outcome, &self.config.likelihood);
                    self.session.hypotheses = table.snapshot();
                    self.publish().await;

                    match signal {
                        RankerSignal::Confirmed { cause_id } => {
                            return DiagnoseOutcome::Confirmed {
                                cause_id,
                                evidence_ref,
                                probe_id,
                            };
                        }
                        RankerSignal::Exhausted => return DiagnoseOutcome::Exhausted,
                        RankerSignal::Updated => {}
                    }
                }
                Wake::Evidence(None) => {
                    // Unreachable while the driver holds a sender clone.
                    warn!(session_id = %self.session.id, "evidence channel closed");
                    return DiagnoseOutcome::Terminal;
                }
                Wake::Command(command) => {
                    if self.handle_idle_command(command).await {
                        return DiagnoseOutcome::Terminal;
                    }
                }
                Wake::Deadline => {
                    self.escalate_ttl().await;
                    return DiagnoseOutcome::Terminal;
                }
            }
        }
    }

    /// Handle a command arriving while no approval is pending. Returns
    /// `true` when the session reached a terminal status.
    pub(crate) async fn handle_idle_command(&mut self, command: Option<SessionCommand>) -> bool {
        match command {
            None => {
                self.commands_open = false;
                false
            }
            Some(SessionCommand::Cancel { actor }) => {
                self.cancel(actor).await;
                true
            }
            Some(SessionCommand::Approve {
                action_id, reply, ..
            }) => {
                let _ = reply.send(Err(SessionError::NoPendingApproval {
                    session_id: self.session.id,
                    action_id,
                }));
                false
            }
        }
    }

    /// Drain queued commands at a cooperative checkpoint; also enforces
    /// the session TTL. Returns `true` when the session ended.
    pub(crate) async fn checkpoint(&mut self) -> bool {
        while let Ok(evidence) = self.evidence_rx.try_recv() {
            self.session.append_evidence(evidence);
        }
        while let Ok(command) = self.commands.try_recv() {
            if self.handle_idle_command(Some(command)).await {
                return true;
            }
        }
        if tokio::time::Instant::now() >= self.deadline {
            self.escalate_ttl().await;
            return true;
        }
        false
    }

    pub(crate) async fn cancel(&mut self, actor: Actor) {
        self.session.pending_approval = None;
        self.session.transition(
            SessionStatus::Cancelled,
            actor,
            "cancelled by operator",
            None,
            None,
        );
        self.publish().await;
    }

    pub(crate) async fn escalate_ttl(&mut self) {
        warn!(session_id = %self.session.id, "session ttl exceeded, escalating");
        self.session.pending_approval = None;
        self.session.transition(
            SessionStatus::Escalated,
            Actor::Automated,
            "session ttl exceeded",
            None,
            None,
        );
        self.publish().await;
    }

    pub(crate) async fn escalate_partial(&mut self, reason: &str) {
        let report = PartialDiagnosis {
            visited: self.session.visited.clone(),
            beliefs: self.session.hypotheses.clone(),
            evidence_count: self.session.evidence.len(),
        };
        self.session.pending_approval = None;
        self.session.transition(
            SessionStatus::Escalated,
            Actor::Automated,
            format!("{reason}; partial diagnosis: {}", report.to_json()),
            None,
            None,
        );
        self.publish().await;
    }

    /// Publish the current state as the readable snapshot.
    pub(crate) async fn publish(&self) {
        *self.shared.write().await = self.session.clone();
    }
}
