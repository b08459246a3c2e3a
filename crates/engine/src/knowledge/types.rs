//! Knowledge base record types.
//!
//! These mirror the on-disk runbook schema: an entry describes a symptom
//! signature, an ordered list of candidate causes, and for each cause the
//! diagnostic probes and remediation actions that apply. Entries are
//! immutable once loaded.

use serde::{Deserialize, Serialize};

/// A structured signal descriptor, matched exactly against observed signals.
///
/// Example: `{field: "http_p90_latency", value: ">8s"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructuredSignal {
    /// Signal field name (metric, resource kind, label, ...)
    pub field: String,
    /// Expected value, compared verbatim
    pub value: String,
}

/// A single runbook entry: symptom signature, causes, and related entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookEntry {
    /// Unique entry identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Free-form symptom tags
    #[serde(default)]
    pub symptoms: Vec<String>,
    /// Structured signal descriptors
    #[serde(default)]
    pub signals: Vec<StructuredSignal>,
    /// Candidate causes, in the author's preferred diagnostic order
    pub causes: Vec<Cause>,
    /// Ids of related entries to consult when all causes are refuted
    #[serde(default)]
    pub related: Vec<String>,
}

impl RunbookEntry {
    /// Total weight-bearing signal count (tags plus structured signals).
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.symptoms.len() + self.signals.len()
    }

    /// Look up a cause by id.
    #[must_use]
    pub fn cause(&self, cause_id: &str) -> Option<&Cause> {
        self.causes.iter().find(|c| c.id == cause_id)
    }

    /// Look up a probe by id anywhere in the entry.
    #[must_use]
    pub fn probe(&self, probe_id: &str) -> Option<&Probe> {
        self.causes
            .iter()
            .flat_map(|c| c.probes.iter())
            .find(|p| p.id == probe_id)
    }

    /// Look up an action by id anywhere in the entry.
    #[must_use]
    pub fn action(&self, action_id: &str) -> Option<&RemediationAction> {
        self.causes
            .iter()
            .flat_map(|c| c.actions.iter())
            .find(|a| a.id == action_id)
    }
}

/// A candidate cause under a runbook entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cause {
    /// Unique id within the owning entry
    pub id: String,
    /// One-line description of the suspected fault
    pub summary: String,
    /// Optional prior weight; normalized across the entry's causes at
    /// session start. Absent means uniform.
    #[serde(default)]
    pub prior: Option<f64>,
    /// Diagnostic probes, in execution order
    #[serde(default)]
    pub probes: Vec<Probe>,
    /// Remediation actions, in attempt order
    #[serde(default)]
    pub actions: Vec<RemediationAction>,
}

/// A read-only diagnostic command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    /// Unique id within the owning entry
    pub id: String,
    /// Handlebars command template, rendered against the target context
    /// variables plus the session's structured symptom values
    pub command_template: String,
    /// Must be `true`; entries carrying a mutating probe are rejected at
    /// load time
    #[serde(default)]
    pub read_only: bool,
    /// Evidence the probe is expected to surface when the owning cause is
    /// real
    pub expected_signal: ExpectedSignal,
    /// Optional template for the target-resource identity used to
    /// serialize access (e.g. `deployment/{{service}}`)
    #[serde(default)]
    pub target_resource: Option<String>,
    /// Per-attempt timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempt budget; overrides the engine-wide retry default when set
    #[serde(default)]
    pub retries: Option<u32>,
}

fn default_probe_timeout_secs() -> u64 {
    30
}

/// Declared shape of the evidence a probe produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedSignal {
    /// The probe's stdout must match this regex for a `Pass` outcome
    OutputMatches {
        /// Regex applied to the raw stdout
        pattern: String,
    },
    /// A clean exit alone is the signal
    ExitSuccess,
}

impl ExpectedSignal {
    /// Whether the captured output carries the expected signal.
    ///
    /// The pattern was validated at load time; a pattern that fails to
    /// compile here is treated as a non-match.
    #[must_use]
    pub fn matches(&self, stdout: &str) -> bool {
        match self {
            Self::OutputMatches { pattern } => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(stdout),
                Err(_) => false,
            },
            Self::ExitSuccess => true,
        }
    }
}

/// Risk classification for remediation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    /// No disruption expected (e.g. clearing a finished Job)
    Safe,
    /// Service-affecting but reversible (e.g. scaling, rollout restart)
    Moderate,
    /// Data loss or hard-to-reverse (e.g. deleting a PVC)
    Destructive,
}

impl RiskClass {
    /// Short name for logs and labels.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::Destructive => "destructive",
        }
    }
}

/// A remediation command with its risk class and recovery references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    /// Unique id within the owning entry
    pub id: String,
    /// Handlebars command template
    pub command_template: String,
    /// Risk classification, drives the approval gate
    pub risk: RiskClass,
    /// Id of the action that reverts this one, if any
    #[serde(default)]
    pub rollback_ref: Option<String>,
    /// Id of the probe that verifies the fix; falls back to the probe
    /// whose evidence confirmed the cause
    #[serde(default)]
    pub verify_probe_ref: Option<String>,
    /// Optional target-resource identity template (same semantics as
    /// [`Probe::target_resource`])
    #[serde(default)]
    pub target_resource: Option<String>,
}
