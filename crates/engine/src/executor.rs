//! Diagnostic executor: runs probe and action command templates against
//! the target context.
//!
//! - Per-probe state machine: `Pending → Running → {Completed, Failed,
//!   TimedOut}`
//! - Bounded retries with exponential backoff; exhausted probes yield
//!   Inconclusive evidence instead of failing the session
//! - A semaphore worker pool shared across sessions caps concurrent
//!   probes; probes and actions sharing a rendered target-resource
//!   identity serialize on a per-key mutex
//!
//! The target context itself is a black box: it takes a rendered command
//! line and returns raw output plus exit status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{RemediationError, TargetError};
use crate::knowledge::{Probe, RemediationAction};
use crate::matcher::SymptomSet;
use crate::session::{Evidence, EvidenceOutcome, SignalPayload};
use crate::template::TemplateEngine;

/// Cap on captured stdout/stderr carried in evidence payloads.
const CAPTURE_LIMIT: usize = 2000;

/// Raw result of a command run by the target context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Process exit code
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited clean.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The cluster-command collaborator the engine delegates execution to.
///
/// Implementations run a rendered command line against one concrete
/// cluster context and report raw output. Sessions targeting different
/// clusters get different implementations; the engine never assumes an
/// ambient "current cluster".
#[async_trait]
pub trait TargetContext: Send + Sync {
    /// Stable identity of the target (cluster name).
    fn name(&self) -> &str;

    /// Template variables this target supplies (cluster, namespace, ...).
    fn vars(&self) -> serde_json::Map<String, Value>;

    /// Run one command to completion.
    async fn run(&self, command: &str) -> Result<CommandOutput, TargetError>;
}

/// Execution state of a single probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeRunState {
    /// Queued, not yet started
    Pending,
    /// Command dispatched
    Running,
    /// Command exited clean
    Completed,
    /// Command exited non-zero or the target errored
    Failed,
    /// The attempt hit its timeout
    TimedOut,
}

/// Per-target-resource mutex registry.
///
/// Keys are rendered resource identities (e.g. `deployment/backend`).
/// Waiters queue on the mutex rather than failing, which is the
/// concurrency-conflict policy: contention delays, never errors.
#[derive(Default)]
pub struct TargetLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TargetLocks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for a resource identity.
    #[must_use]
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Build the template variable map for a session: target-context vars,
/// the session's structured symptom values, and the session id.
#[must_use]
pub fn build_vars(
    target: &dyn TargetContext,
    symptoms: &SymptomSet,
    session_id: &str,
) -> Value {
    let mut map = target.vars();
    for signal in &symptoms.signals {
        map.insert(signal.field.clone(), Value::String(signal.value.clone()));
    }
    map.insert(
        "cluster".to_string(),
        Value::String(target.name().to_string()),
    );
    map.insert(
        "session_id".to_string(),
        Value::String(session_id.to_string()),
    );
    Value::Object(map)
}

/// Runs probes and actions against one target context.
pub struct ProbeRunner {
    target: Arc<dyn TargetContext>,
    workers: Arc<Semaphore>,
    locks: Arc<TargetLocks>,
    templates: TemplateEngine,
    retry: RetryConfig,
}

impl ProbeRunner {
    /// Create a runner over a shared worker pool and lock registry.
    #[must_use]
    pub fn new(
        target: Arc<dyn TargetContext>,
        workers: Arc<Semaphore>,
        locks: Arc<TargetLocks>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            target,
            workers,
            locks,
            templates: TemplateEngine::new(),
            retry,
        }
    }

    /// The target this runner executes against.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn TargetContext> {
        &self.target
    }

    /// Run a probe through its full retry budget.
    pub async fn run_probe(&self, probe: &Probe, cause_id: &str, vars: &Value) -> Evidence {
        let attempts = probe.retries.unwrap_or(self.retry.max_attempts).max(1);
        self.run_probe_attempts(probe, cause_id, vars, attempts).await
    }

    /// Run a probe once, without retries. Used for verification polling,
    /// where the poll loop itself is the retry budget.
    pub async fn run_probe_once(&self, probe: &Probe, cause_id: &str, vars: &Value) -> Evidence {
        self.run_probe_attempts(probe, cause_id, vars, 1).await
    }

    async fn run_probe_attempts(
        &self,
        probe: &Probe,
        cause_id: &str,
        vars: &Value,
        max_attempts: u32,
    ) -> Evidence {
        let started = std::time::Instant::now();
        let mut payload = SignalPayload {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            attempts: 0,
            final_state: ProbeRunState::Pending,
            duration_ms: 0,
        };

        let command = match self.templates.render(&probe.command_template, vars) {
            Ok(command) => command,
            Err(e) => {
                warn!(probe_id = %probe.id, error = %e, "probe template render failed");
                payload.stderr = truncate(&e);
                return evidence(probe, cause_id, EvidenceOutcome::Inconclusive, payload, started);
            }
        };

        // Pool permit first, then the resource lock; both are held across
        // the full attempt budget so retries stay serialized too.
        let _permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                payload.stderr = "worker pool closed".to_string();
                return evidence(probe, cause_id, EvidenceOutcome::Inconclusive, payload, started);
            }
        };
        let _guard = self
            .resource_guard(probe.target_resource.as_deref(), vars)
            .await;

        for attempt in 1..=max_attempts {
            payload.attempts = attempt;
            payload.final_state = ProbeRunState::Running;

            let timeout = Duration::from_secs(probe.timeout_secs);
            match tokio::time::timeout(timeout, self.target.run(&command)).await {
                Ok(Ok(out)) => {
                    payload.stdout = truncate(&out.stdout);
                    payload.stderr = truncate(&out.stderr);
                    payload.exit_code = Some(out.exit_code);
                    if out.success() {
                        payload.final_state = ProbeRunState::Completed;
                        let outcome = if probe.expected_signal.matches(&out.stdout) {
                            EvidenceOutcome::Pass
                        } else {
                            EvidenceOutcome::Fail
                        };
                        return evidence(probe, cause_id, outcome, payload, started);
                    }
                    payload.final_state = ProbeRunState::Failed;
                    debug!(probe_id = %probe.id, attempt, exit_code = out.exit_code, "probe attempt failed");
                }
                Ok(Err(e)) => {
                    payload.final_state = ProbeRunState::Failed;
                    payload.stderr = truncate(&e.to_string());
                    debug!(probe_id = %probe.id, attempt, error = %e, "probe attempt errored");
                }
                Err(_) => {
                    payload.final_state = ProbeRunState::TimedOut;
                    debug!(probe_id = %probe.id, attempt, timeout_secs = probe.timeout_secs, "probe attempt timed out");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.backoff_after(attempt)).await;
            }
        }

        warn!(probe_id = %probe.id, attempts = max_attempts, "probe retries exhausted, recording inconclusive");
        evidence(probe, cause_id, EvidenceOutcome::Inconclusive, payload, started)
    }

    /// Run a remediation (or rollback) command: single attempt, hard
    /// timeout, serialized on the action's target resource.
    pub async fn run_action(
        &self,
        action: &RemediationAction,
        vars: &Value,
        timeout: Duration,
    ) -> Result<CommandOutput, RemediationError> {
        let command = self
            .templates
            .render(&action.command_template, vars)
            .map_err(RemediationError::Template)?;

        let _guard = self.resource_guard(action.target_resource.as_deref(), vars).await;

        match tokio::time::timeout(timeout, self.target.run(&command)).await {
            Ok(Ok(out)) if out.success() => Ok(out),
            Ok(Ok(out)) => Err(RemediationError::CommandFailed {
                exit_code: out.exit_code,
                stderr: truncate(&out.stderr),
            }),
            Ok(Err(e)) => Err(RemediationError::Target(e)),
            Err(_) => Err(RemediationError::Timeout(timeout)),
        }
    }

    async fn resource_guard(
        &self,
        target_resource: Option<&str>,
        vars: &Value,
    ) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let template = target_resource?;
        match self.templates.render(template, vars) {
            Ok(key) => {
                let lock = self.locks.lock_for(&key);
                debug!(resource = %key, "serializing on target resource");
                Some(lock.lock_owned().await)
            }
            Err(e) => {
                warn!(error = %e, "target resource template render failed, running unserialized");
                None
            }
        }
    }
}

fn evidence(
    probe: &Probe,
    cause_id: &str,
    outcome: EvidenceOutcome,
    mut payload: SignalPayload,
    started: std::time::Instant,
) -> Evidence {
    payload.duration_ms = started.elapsed().as_millis() as u64;
    Evidence {
        probe_id: probe.id.clone(),
        cause_id: cause_id.to_string(),
        outcome,
        observed_at: Utc::now(),
        payload,
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= CAPTURE_LIMIT {
        s.to_string()
    } else {
        let mut end = CAPTURE_LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
