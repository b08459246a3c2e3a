//! Remediation orchestration.
//!
//! Drives a session from a confirmed hypothesis through proposal,
//! approval gating, execution, verification, and rollback:
//!
//! `HypothesisConfirmed → RemediationProposed → RemediationApproved →
//! Executing → Verifying → {Resolved | RollingBack → RolledBack}`
//!
//! Gate rules: safe actions may auto-approve under policy; moderate and
//! destructive actions always need a recorded operator approval, and
//! destructive actions are never auto-approved no matter what the policy
//! says. A command already executing runs to completion before a cancel
//! is honored.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::driver::{SessionCommand, SessionDriver};
use crate::error::SessionError;
use crate::knowledge::{Cause, Probe, RemediationAction, RiskClass, RunbookEntry};
use crate::session::{ActionEventKind, Actor, EvidenceOutcome, PendingApproval, SessionStatus};

enum ApprovalOutcome {
    Approved(Actor),
    Terminal,
}

enum VerifyOutcome {
    /// The expected signal is gone; the symptom cleared
    Cleared(usize),
    /// The signal is still present (or never became observable)
    StillBreaching,
    /// The session ended while verifying
    Terminal,
}

enum RollbackOutcome {
    RolledBack,
    Terminal,
}

impl SessionDriver {
    /// Work through the confirmed cause's actions until one resolves the
    /// incident or the session reaches a terminal status.
    pub(crate) async fn remediate(
        &mut self,
        entry: &RunbookEntry,
        cause_id: &str,
        confirm_evidence: usize,
        triggering_probe: &str,
    ) {
        self.session.transition(
            SessionStatus::HypothesisConfirmed,
            Actor::Automated,
            format!("cause {cause_id} confirmed"),
            Some(confirm_evidence),
            None,
        );
        self.publish().await;

        let Some(cause) = entry.cause(cause_id).cloned() else {
            // The ranker only confirms causes it was initialized with.
            warn!(session_id = %self.session.id, cause_id, "confirmed cause missing from entry");
            self.escalate_partial("confirmed cause missing from entry").await;
            return;
        };

        // Actions referenced as another action's rollback are recovery
        // commands, not candidate fixes.
        let rollback_targets: HashSet<String> = cause
            .actions
            .iter()
            .filter_map(|a| a.rollback_ref.clone())
            .collect();

        let mut attempted: HashSet<String> = HashSet::new();
        loop {
            let Some(action) = cause
                .actions
                .iter()
                .find(|a| !attempted.contains(&a.id) && !rollback_targets.contains(&a.id))
                .cloned()
            else {
                let detail = if attempted.is_empty() {
                    format!("confirmed cause {cause_id} has no remediation actions")
                } else {
                    format!("remediation options for cause {cause_id} exhausted")
                };
                self.session.transition(
                    SessionStatus::Escalated,
                    Actor::Automated,
                    detail,
                    None,
                    None,
                );
                self.publish().await;
                return;
            };
            attempted.insert(action.id.clone());

            self.session.pending_approval = Some(PendingApproval {
                action_id: action.id.clone(),
                cause_id: cause.id.clone(),
                risk: action.risk,
                proposed_at: chrono::Utc::now(),
            });
            self.session.record_action(
                &action.id,
                &cause.id,
                ActionEventKind::Proposed,
                Actor::Automated,
                None,
                None,
            );
            self.session.transition(
                SessionStatus::RemediationProposed,
                Actor::Automated,
                format!("proposed action {} (risk={})", action.id, action.risk.name()),
                None,
                Some(action.id.clone()),
            );
            self.publish().await;

            let approver = match self.resolve_approval(&cause, &action).await {
                ApprovalOutcome::Approved(actor) => actor,
                ApprovalOutcome::Terminal => return,
            };
            self.session.pending_approval = None;
            self.session.transition(
                SessionStatus::RemediationApproved,
                approver,
                format!("action {} approved", action.id),
                None,
                Some(action.id.clone()),
            );
            self.publish().await;

            self.session.transition(
                SessionStatus::Executing,
                Actor::Automated,
                format!("executing action {}", action.id),
                None,
                Some(action.id.clone()),
            );
            self.session.record_action(
                &action.id,
                &cause.id,
                ActionEventKind::ExecutionStarted,
                Actor::Automated,
                None,
                None,
            );
            self.publish().await;

            // The command runs to completion: cancellation is observed at
            // the checkpoint after, never mid-mutation.
            let result = self
                .runner
                .run_action(&action, &self.vars, self.config.action_timeout())
                .await;

            match result {
                Err(e) => {
                    warn!(
                        session_id = %self.session.id,
                        action_id = %action.id,
                        error = %e,
                        "remediation command failed"
                    );
                    self.session.record_action(
                        &action.id,
                        &cause.id,
                        ActionEventKind::ExecutionFailed,
                        Actor::Automated,
                        None,
                        Some(e.to_string()),
                    );
                    if action.rollback_ref.is_some() {
                        match self.rollback(entry, &cause, &action).await {
                            RollbackOutcome::RolledBack => {
                                if self.checkpoint().await {
                                    return;
                                }
                            }
                            RollbackOutcome::Terminal => return,
                        }
                    } else {
                        self.session.transition(
                            SessionStatus::Escalated,
                            Actor::Automated,
                            format!("action {} failed with no rollback mapped: {e}", action.id),
                            None,
                            Some(action.id.clone()),
                        );
                        self.publish().await;
                        return;
                    }
                }
                Ok(_) => {
                    self.session.record_action(
                        &action.id,
                        &cause.id,
                        ActionEventKind::ExecutionSucceeded,
                        Actor::Automated,
                        None,
                        None,
                    );
                    if self.checkpoint().await {
                        return;
                    }
                    self.session.transition(
                        SessionStatus::Verifying,
                        Actor::Automated,
                        format!("verifying action {}", action.id),
                        None,
                        Some(action.id.clone()),
                    );
                    self.publish().await;

                    match self.verify(entry, &cause, &action, triggering_probe).await {
                        VerifyOutcome::Cleared(evidence_ref) => {
                            self.session.record_action(
                                &action.id,
                                &cause.id,
                                ActionEventKind::VerificationPassed,
                                Actor::Automated,
                                Some(evidence_ref),
                                None,
                            );
                            info!(session_id = %self.session.id, action_id = %action.id, "incident resolved");
                            self.session.transition(
                                SessionStatus::Resolved,
                                Actor::Automated,
                                format!("action {} verified, symptom cleared", action.id),
                                Some(evidence_ref),
                                Some(action.id.clone()),
                            );
                            self.publish().await;
                            return;
                        }
                        VerifyOutcome::Terminal => return,
                        VerifyOutcome::StillBreaching => {
                            self.session.record_action(
                                &action.id,
                                &cause.id,
                                ActionEventKind::VerificationExhausted,
                                Actor::Automated,
                                None,
                                None,
                            );
                            if action.rollback_ref.is_some() {
                                match self.rollback(entry, &cause, &action).await {
                                    RollbackOutcome::RolledBack => {
                                        if self.checkpoint().await {
                                            return;
                                        }
                                    }
                                    RollbackOutcome::Terminal => return,
                                }
                            } else {
                                self.session.transition(
                                    SessionStatus::Escalated,
                                    Actor::Automated,
                                    format!(
                                        "verification of action {} exhausted with no rollback mapped",
                                        action.id
                                    ),
                                    None,
                                    Some(action.id.clone()),
                                );
                                self.publish().await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Resolve the approval gate for a proposed action.
    async fn resolve_approval(
        &mut self,
        cause: &Cause,
        action: &RemediationAction,
    ) -> ApprovalOutcome {
        // The risk check is structural: only Safe is ever eligible for
        // auto-approval, so no policy setting can wave a destructive
        // action through.
        if action.risk == RiskClass::Safe && self.config.approval.auto_approve_safe {
            self.session.record_action(
                &action.id,
                &cause.id,
                ActionEventKind::AutoApproved,
                Actor::Automated,
                None,
                Some("policy: auto_approve_safe".to_string()),
            );
            return ApprovalOutcome::Approved(Actor::Automated);
        }

        info!(
            session_id = %self.session.id,
            action_id = %action.id,
            risk = action.risk.name(),
            "awaiting operator approval"
        );

        loop {
            enum Wake {
                Command(Option<SessionCommand>),
                Deadline,
            }
            let wake = tokio::select! {
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                () = tokio::time::sleep_until(self.deadline) => Wake::Deadline,
            };
            match wake {
                Wake::Command(None) => {
                    // No command source left; the approval can never
                    // arrive, so waiting further just burns the TTL.
                    self.commands_open = false;
                    self.session.pending_approval = None;
                    self.session.transition(
                        SessionStatus::Escalated,
                        Actor::Automated,
                        format!(
                            "approval for action {} can no longer arrive, escalating",
                            action.id
                        ),
                        None,
                        Some(action.id.clone()),
                    );
                    self.publish().await;
                    return ApprovalOutcome::Terminal;
                }
                Wake::Command(Some(SessionCommand::Cancel { actor })) => {
                    self.cancel(actor).await;
                    return ApprovalOutcome::Terminal;
                }
                Wake::Command(Some(SessionCommand::Approve {
                    action_id,
                    actor,
                    reply,
                })) => {
                    if action_id == action.id {
                        let _ = reply.send(Ok(()));
                        self.session.record_action(
                            &action.id,
                            &cause.id,
                            ActionEventKind::Approved,
                            actor.clone(),
                            None,
                            None,
                        );
                        return ApprovalOutcome::Approved(actor);
                    }
                    let _ = reply.send(Err(SessionError::NoPendingApproval {
                        session_id: self.session.id,
                        action_id,
                    }));
                }
                Wake::Deadline => {
                    self.escalate_ttl().await;
                    return ApprovalOutcome::Terminal;
                }
            }
        }
    }

    /// Poll the verification probe until the symptom clears or the
    /// budget runs out.
    ///
    /// Verification succeeds when the probe stops observing its expected
    /// signal: the signal is the problem's signature, so its absence is
    /// the fix.
    async fn verify(
        &mut self,
        entry: &RunbookEntry,
        cause: &Cause,
        action: &RemediationAction,
        triggering_probe: &str,
    ) -> VerifyOutcome {
        let probe = self.verification_probe(entry, cause, action, triggering_probe);
        let Some(probe) = probe else {
            warn!(
                session_id = %self.session.id,
                action_id = %action.id,
                "no verification probe available"
            );
            return VerifyOutcome::StillBreaching;
        };

        let attempts = self.config.verification.attempts.max(1);
        let interval = std::time::Duration::from_secs(self.config.verification.interval_secs);

        for attempt in 1..=attempts {
            let evidence = self.runner.run_probe_once(&probe, &cause.id, &self.vars).await;
            let outcome = evidence.outcome;
            let evidence_ref = self.session.append_evidence(evidence);
            self.publish().await;

            if outcome == EvidenceOutcome::Fail {
                return VerifyOutcome::Cleared(evidence_ref);
            }

            if attempt < attempts {
                enum Wake {
                    Command(Option<SessionCommand>),
                    Deadline,
                    Tick,
                }
                let wake = tokio::select! {
                    command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                    () = tokio::time::sleep_until(self.deadline) => Wake::Deadline,
                    () = tokio::time::sleep(interval) => Wake::Tick,
                };
                match wake {
                    Wake::Command(command) => {
                        if self.handle_idle_command(command).await {
                            return VerifyOutcome::Terminal;
                        }
                    }
                    Wake::Deadline => {
                        self.escalate_ttl().await;
                        return VerifyOutcome::Terminal;
                    }
                    Wake::Tick => {}
                }
            }
        }

        VerifyOutcome::StillBreaching
    }

    /// Pick the probe that verifies an action: the declared
    /// `verify_probe_ref`, else the cause's last Pass probe, else the
    /// probe whose evidence triggered confirmation, else the cause's
    /// first probe.
    fn verification_probe(
        &self,
        entry: &RunbookEntry,
        cause: &Cause,
        action: &RemediationAction,
        triggering_probe: &str,
    ) -> Option<Probe> {
        let last_pass = self
            .session
            .evidence
            .iter()
            .rev()
            .find(|e| e.cause_id == cause.id && e.outcome == EvidenceOutcome::Pass)
            .map(|e| e.probe_id.clone());

        action
            .verify_probe_ref
            .as_deref()
            .and_then(|id| entry.probe(id))
            .or_else(|| last_pass.as_deref().and_then(|id| entry.probe(id)))
            .or_else(|| entry.probe(triggering_probe))
            .or_else(|| cause.probes.first())
            .cloned()
    }

    /// Execute the mapped rollback for a failed action.
    async fn rollback(
        &mut self,
        entry: &RunbookEntry,
        cause: &Cause,
        action: &RemediationAction,
    ) -> RollbackOutcome {
        let rollback_id = action.rollback_ref.as_deref().unwrap_or_default();
        let Some(rollback) = entry.action(rollback_id).cloned() else {
            // Dangling refs are rejected at load; reaching this means the
            // knowledge base changed under us.
            self.session.transition(
                SessionStatus::Failed,
                Actor::Automated,
                format!("rollback {rollback_id} not found for action {}", action.id),
                None,
                Some(action.id.clone()),
            );
            self.publish().await;
            return RollbackOutcome::Terminal;
        };

        self.session.transition(
            SessionStatus::RollingBack,
            Actor::Automated,
            format!("rolling back action {} via {}", action.id, rollback.id),
            None,
            Some(rollback.id.clone()),
        );
        self.session.record_action(
            &rollback.id,
            &cause.id,
            ActionEventKind::RollbackStarted,
            Actor::Automated,
            None,
            None,
        );
        self.publish().await;

        match self
            .runner
            .run_action(&rollback, &self.vars, self.config.action_timeout())
            .await
        {
            Ok(_) => {
                self.session.record_action(
                    &rollback.id,
                    &cause.id,
                    ActionEventKind::RollbackSucceeded,
                    Actor::Automated,
                    None,
                    None,
                );
                self.session.transition(
                    SessionStatus::RolledBack,
                    Actor::Automated,
                    format!("action {} rolled back", action.id),
                    None,
                    Some(rollback.id.clone()),
                );
                self.publish().await;
                RollbackOutcome::RolledBack
            }
            Err(e) => {
                warn!(
                    session_id = %self.session.id,
                    rollback_id = %rollback.id,
                    error = %e,
                    "rollback command failed"
                );
                self.session.record_action(
                    &rollback.id,
                    &cause.id,
                    ActionEventKind::RollbackFailed,
                    Actor::Automated,
                    None,
                    Some(e.to_string()),
                );
                self.session.transition(
                    SessionStatus::Failed,
                    Actor::Automated,
                    format!("rollback {} failed: {e}", rollback.id),
                    None,
                    Some(rollback.id.clone()),
                );
                self.publish().await;
                RollbackOutcome::Terminal
            }
        }
    }
}
