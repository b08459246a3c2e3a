//! Per-incident session state and the immutable audit trail.
//!
//! A [`Session`] is owned and mutated by exactly one driver task; everyone
//! else sees published snapshots. The evidence, action, and audit logs are
//! append-only; records are never rewritten once pushed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::ProbeRunState;
use crate::knowledge::RiskClass;
use crate::matcher::SymptomSet;
use crate::ranker::HypothesisState;

/// Incident session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Running probes and updating beliefs
    Diagnosing,
    /// A cause crossed the confirmation threshold
    HypothesisConfirmed,
    /// An action is selected and awaiting the approval gate
    RemediationProposed,
    /// Approval recorded; execution is next
    RemediationApproved,
    /// The remediation command is running
    Executing,
    /// Polling the verification probe
    Verifying,
    /// A rollback command is running
    RollingBack,
    /// The fix verified clean
    Resolved,
    /// The last action was reverted
    RolledBack,
    /// The engine could not resolve automatically; a human owns it now
    Escalated,
    /// An operator cancelled the session
    Cancelled,
    /// A rollback failed; the target may be half-reverted
    Failed,
}

impl SessionStatus {
    /// Whether this status ends the session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Escalated | Self::Cancelled | Self::Failed
        )
    }

    /// Short name for logs and labels.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Diagnosing => "diagnosing",
            Self::HypothesisConfirmed => "hypothesis_confirmed",
            Self::RemediationProposed => "remediation_proposed",
            Self::RemediationApproved => "remediation_approved",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::RollingBack => "rolling_back",
            Self::Resolved => "resolved",
            Self::RolledBack => "rolled_back",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Who drove a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The engine itself
    Automated,
    /// A human operator
    Operator {
        /// Operator identity as supplied by the caller
        id: String,
    },
}

impl Actor {
    /// Build an operator actor.
    #[must_use]
    pub fn operator(id: impl Into<String>) -> Self {
        Self::Operator { id: id.into() }
    }
}

/// Probe outcome as evidence for or against a cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOutcome {
    /// The probe observed its expected signal
    Pass,
    /// The probe ran clean and the signal was absent
    Fail,
    /// The probe could not produce a verdict (timeout, errors, exhausted
    /// retries)
    Inconclusive,
}

/// Raw signal captured alongside an evidence verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Captured stdout, truncated
    pub stdout: String,
    /// Captured stderr, truncated
    pub stderr: String,
    /// Exit code of the last attempt, if the command ran
    pub exit_code: Option<i32>,
    /// Attempts consumed
    pub attempts: u32,
    /// Final probe execution state
    pub final_state: ProbeRunState,
    /// Wall-clock duration across attempts
    pub duration_ms: u64,
}

/// One observation from a probe run. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Probe that produced this
    pub probe_id: String,
    /// Cause the probe was testing
    pub cause_id: String,
    /// Verdict
    pub outcome: EvidenceOutcome,
    /// When the verdict was reached
    pub observed_at: DateTime<Utc>,
    /// Raw signal
    pub payload: SignalPayload,
}

/// Lifecycle events of a remediation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionEventKind {
    /// Selected as the next action for the confirmed cause
    Proposed,
    /// Approved by policy without an operator
    AutoApproved,
    /// Approved by an operator
    Approved,
    /// Command dispatched to the target
    ExecutionStarted,
    /// Command exited clean
    ExecutionSucceeded,
    /// Command failed or timed out
    ExecutionFailed,
    /// Verification probe confirmed the symptom cleared
    VerificationPassed,
    /// Verification polling ran out without the symptom clearing
    VerificationExhausted,
    /// Rollback command dispatched
    RollbackStarted,
    /// Rollback command exited clean
    RollbackSucceeded,
    /// Rollback command failed
    RollbackFailed,
}

/// One entry in the session's action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Monotonic sequence number within the session
    pub seq: u64,
    /// Action id
    pub action_id: String,
    /// Owning cause id
    pub cause_id: String,
    /// What happened
    pub kind: ActionEventKind,
    /// Who drove it
    pub actor: Actor,
    /// When
    pub at: DateTime<Utc>,
    /// Index into the evidence log at the time of the event
    pub evidence_before: Option<usize>,
    /// Index of evidence produced by the event, if any
    pub evidence_after: Option<usize>,
    /// Extra context
    pub detail: Option<String>,
}

/// One entry in the session's audit log, appended on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic sequence number within the session
    pub seq: u64,
    /// Owning session
    pub session_id: Uuid,
    /// When
    pub at: DateTime<Utc>,
    /// Who drove the transition
    pub actor: Actor,
    /// Status before
    pub from: SessionStatus,
    /// Status after
    pub to: SessionStatus,
    /// Evidence log index tied to the transition, if any
    pub evidence_ref: Option<usize>,
    /// Action id tied to the transition, if any
    pub action_ref: Option<String>,
    /// Human-readable context
    pub detail: String,
}

/// An action waiting on the approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Action awaiting approval
    pub action_id: String,
    /// Owning cause
    pub cause_id: String,
    /// Risk class driving the gate
    pub risk: RiskClass,
    /// When the proposal was made
    pub proposed_at: DateTime<Utc>,
}

/// Full per-incident state. Cloned as the public snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session id (one active session per incident)
    pub id: Uuid,
    /// Target context identity (cluster) this session acts on
    pub target: String,
    /// Current status
    pub status: SessionStatus,
    /// Observed symptoms the session was started with
    pub symptoms: SymptomSet,
    /// Runbook entry currently under diagnosis
    pub current_entry: Option<String>,
    /// Entries visited, in order; never contains duplicates
    pub visited: Vec<String>,
    /// Belief state over the current entry's causes
    pub hypotheses: Vec<HypothesisState>,
    /// Append-only evidence log
    pub evidence: Vec<Evidence>,
    /// Append-only action log
    pub actions: Vec<ActionRecord>,
    /// Append-only audit log
    pub audit: Vec<AuditRecord>,
    /// Action currently awaiting approval, if any
    pub pending_approval: Option<PendingApproval>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Set when the session reached a terminal status and was archived
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a fresh session in `Diagnosing`.
    #[must_use]
    pub fn new(id: Uuid, target: impl Into<String>, symptoms: SymptomSet) -> Self {
        let now = Utc::now();
        let mut session = Self {
            id,
            target: target.into(),
            status: SessionStatus::Diagnosing,
            symptoms,
            current_entry: None,
            visited: Vec::new(),
            hypotheses: Vec::new(),
            evidence: Vec::new(),
            actions: Vec::new(),
            audit: Vec::new(),
            pending_approval: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        session.push_audit(
            Actor::Automated,
            SessionStatus::Diagnosing,
            SessionStatus::Diagnosing,
            None,
            None,
            "session started".to_string(),
        );
        session
    }

    /// Transition to a new status, appending the audit record.
    pub fn transition(
        &mut self,
        to: SessionStatus,
        actor: Actor,
        detail: impl Into<String>,
        evidence_ref: Option<usize>,
        action_ref: Option<String>,
    ) {
        let from = self.status;
        self.status = to;
        self.push_audit(actor, from, to, evidence_ref, action_ref, detail.into());
        if to.is_terminal() {
            self.closed_at = Some(self.updated_at);
        }
    }

    /// Append an evidence record, returning its log index.
    pub fn append_evidence(&mut self, evidence: Evidence) -> usize {
        self.updated_at = Utc::now();
        self.evidence.push(evidence);
        self.evidence.len() - 1
    }

    /// Append an action record.
    pub fn record_action(
        &mut self,
        action_id: &str,
        cause_id: &str,
        kind: ActionEventKind,
        actor: Actor,
        evidence_after: Option<usize>,
        detail: Option<String>,
    ) {
        let seq = self.actions.len() as u64;
        self.actions.push(ActionRecord {
            seq,
            action_id: action_id.to_string(),
            cause_id: cause_id.to_string(),
            kind,
            actor,
            at: Utc::now(),
            evidence_before: self.evidence.len().checked_sub(1),
            evidence_after,
            detail,
        });
        self.updated_at = Utc::now();
    }

    /// Record a visited runbook entry. Returns `false` if it was already
    /// in the visited set.
    pub fn visit(&mut self, entry_id: &str) -> bool {
        if self.visited.iter().any(|v| v == entry_id) {
            return false;
        }
        self.visited.push(entry_id.to_string());
        self.current_entry = Some(entry_id.to_string());
        self.updated_at = Utc::now();
        true
    }

    /// Whether the session reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn push_audit(
        &mut self,
        actor: Actor,
        from: SessionStatus,
        to: SessionStatus,
        evidence_ref: Option<usize>,
        action_ref: Option<String>,
        detail: String,
    ) {
        let seq = self.audit.len() as u64;
        let at = Utc::now();
        self.audit.push(AuditRecord {
            seq,
            session_id: self.id,
            at,
            actor,
            from,
            to,
            evidence_ref,
            action_ref,
            detail,
        });
        self.updated_at = at;
    }
}
