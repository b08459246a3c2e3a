//! End-to-end session scenarios against a scripted target context.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use medic_engine::knowledge::{load_entries, LoadReport, RunbookEntry};
use medic_engine::session::ActionEventKind;
use medic_engine::{
    Actor, CommandOutput, Engine, EngineConfig, KnowledgeBase, LikelihoodConfig, RetryConfig,
    SessionStatus, SymptomSet, TargetContext, TargetError, VerificationConfig,
};

/// A scripted rule: commands containing `needle` pop outputs from the
/// queue; the last output repeats once the queue drains.
struct Rule {
    needle: String,
    outputs: VecDeque<CommandOutput>,
}

struct ScriptedTarget {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    fn new(rules: Vec<(&str, Vec<CommandOutput>)>) -> Self {
        Self {
            rules: Mutex::new(
                rules
                    .into_iter()
                    .map(|(needle, outputs)| Rule {
                        needle: needle.to_string(),
                        outputs: outputs.into_iter().collect(),
                    })
                    .collect(),
            ),
            commands: Mutex::new(Vec::new()),
        }
    }

    fn commands_run(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetContext for ScriptedTarget {
    fn name(&self) -> &str {
        "scripted-cluster"
    }

    fn vars(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("namespace".to_string(), Value::String("prod".to_string()));
        map
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, TargetError> {
        self.commands.lock().unwrap().push(command.to_string());
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if command.contains(rule.needle.as_str()) {
                let output = if rule.outputs.len() > 1 {
                    rule.outputs.pop_front().unwrap()
                } else {
                    rule.outputs
                        .front()
                        .cloned()
                        .unwrap_or_else(|| out("", 0))
                };
                return Ok(output);
            }
        }
        Ok(out("", 0))
    }
}

fn out(stdout: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
    }
}

fn kb_from_yaml(yaml: &str) -> KnowledgeBase {
    let entries: Vec<RunbookEntry> = serde_yaml::from_str(yaml).expect("fixture should parse");
    let mut report = LoadReport::default();
    let kb = load_entries(entries, &mut report);
    assert!(
        report.excluded.is_empty(),
        "fixture rejected: {:?}",
        report.excluded
    );
    kb
}

/// Config tuned for tests: no backoff, no verification interval, fast
/// failure likelihoods where needed.
fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
        },
        verification: VerificationConfig {
            attempts: 3,
            interval_secs: 0,
        },
        ..EngineConfig::default()
    }
}

async fn wait_for_status(engine: &Engine, id: Uuid, wanted: SessionStatus) {
    for _ in 0..500 {
        let snapshot = engine.get_status(id).await.expect("session should exist");
        if snapshot.status == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = engine.get_status(id).await.expect("session should exist");
    panic!(
        "session never reached {wanted:?}, stuck in {:?}: {:#?}",
        snapshot.status, snapshot.audit
    );
}

async fn wait_for_terminal(engine: &Engine, id: Uuid) -> medic_engine::Session {
    for _ in 0..500 {
        let snapshot = engine.get_status(id).await.expect("session should exist");
        if snapshot.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached a terminal status");
}

const LATENCY_RUNBOOK: &str = r#"
- id: backend-latency
  title: Backend service latency breach
  symptoms: [high_latency]
  signals:
    - field: service
      value: backend-service
  causes:
    - id: database-slow
      summary: Database saturated, queries queueing
      probes:
        - id: trace-query
          command_template: "trace-query --service {{service}} -n {{namespace}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "db_time_ms=[0-9]{4,}"
          timeout_secs: 5
      actions:
        - id: scale-db-replicas
          command_template: "kubectl scale statefulset/db --replicas=5 -n {{namespace}}"
          risk: moderate
          rollback_ref: revert-db-replicas
          verify_probe_ref: latency-check
        - id: revert-db-replicas
          command_template: "kubectl scale statefulset/db --replicas=3 -n {{namespace}}"
          risk: moderate
    - id: network-loss
      summary: Packet loss between services
      probes:
        - id: ping-mesh
          command_template: "mesh-ping --service {{service}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "loss=[1-9][0-9]*%"
          timeout_secs: 5
  related: []
"#;

/// End-to-end latency incident: trace evidence implicates the database
/// cause, the moderate scale-up needs an approval, verification still
/// breaches, the mapped rollback runs, and the session escalates with
/// the rollback in the action log.
#[tokio::test(flavor = "multi_thread")]
async fn test_latency_scenario_rollback_then_escalate() {
    // The latency entry needs a probe for the verify ref.
    let yaml = LATENCY_RUNBOOK.replace(
        "      probes:\n        - id: trace-query",
        "      probes:\n        - id: latency-check\n          command_template: \"latency-check --service {{service}}\"\n          read_only: true\n          expected_signal:\n            kind: output_matches\n            pattern: \"p90=(8|9|[0-9]{2,})s\"\n          timeout_secs: 5\n        - id: trace-query",
    );

    let target = Arc::new(ScriptedTarget::new(vec![
        // Latency still breaching before and after the fix.
        ("latency-check", vec![out("p90=12s", 0)]),
        ("trace-query", vec![out("db_time_ms=4200", 0)]),
        ("mesh-ping", vec![out("loss=0%", 0)]),
        ("--replicas=5", vec![out("scaled", 0)]),
        ("--replicas=3", vec![out("scaled", 0)]),
    ]));

    let engine = Engine::new(kb_from_yaml(&yaml), fast_config(), Arc::clone(&target) as Arc<dyn TargetContext>);
    let session_id = engine
        .start_session(SymptomSet {
            tags: vec!["high_latency".to_string()],
            signals: vec![medic_engine::StructuredSignal {
                field: "service".to_string(),
                value: "backend-service".to_string(),
            }],
        })
        .await;

    // Moderate risk: the proposal must wait for an operator.
    wait_for_status(&engine, session_id, SessionStatus::RemediationProposed).await;
    let snapshot = engine.get_status(session_id).await.unwrap();
    let pending = snapshot.pending_approval.expect("approval should be pending");
    assert_eq!(pending.action_id, "scale-db-replicas");

    engine
        .approve_action(session_id, "scale-db-replicas", Actor::operator("alice"))
        .await
        .expect("approval should land");

    let final_session = wait_for_terminal(&engine, session_id).await;
    assert_eq!(final_session.status, SessionStatus::Escalated);

    // The database cause is the one that confirmed.
    let confirmed = final_session
        .audit
        .iter()
        .find(|r| r.to == SessionStatus::HypothesisConfirmed)
        .expect("hypothesis should confirm");
    assert!(confirmed.detail.contains("database-slow"));

    // Rollback ran, and ran before the escalation.
    let kinds: Vec<ActionEventKind> = final_session.actions.iter().map(|a| a.kind).collect();
    assert!(kinds.contains(&ActionEventKind::Approved));
    assert!(kinds.contains(&ActionEventKind::ExecutionSucceeded));
    assert!(kinds.contains(&ActionEventKind::VerificationExhausted));
    assert!(kinds.contains(&ActionEventKind::RollbackSucceeded));

    let rolling_back_seq = final_session
        .audit
        .iter()
        .find(|r| r.to == SessionStatus::RollingBack)
        .expect("rollback should be audited")
        .seq;
    let escalated_seq = final_session
        .audit
        .iter()
        .find(|r| r.to == SessionStatus::Escalated)
        .expect("escalation should be audited")
        .seq;
    assert!(rolling_back_seq < escalated_seq, "rollback must precede escalation");

    // The revert command actually reached the cluster.
    assert!(target
        .commands_run()
        .iter()
        .any(|c| c.contains("--replicas=3")));
}

/// A safe action under auto-approve policy resolves without an operator
/// when verification clears.
#[tokio::test(flavor = "multi_thread")]
async fn test_safe_action_auto_approves_and_resolves() {
    let yaml = r#"
- id: stuck-job
  title: Stuck batch job
  symptoms: [job_stuck]
  causes:
    - id: finished-pods
      summary: Completed pods piling up
      probes:
        - id: count-completed
          command_template: "kubectl get pods -n {{namespace}} --field-selector=status.phase=Succeeded"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "Succeeded"
          timeout_secs: 5
      actions:
        - id: clear-completed
          command_template: "kubectl delete pods --field-selector=status.phase=Succeeded -n {{namespace}}"
          risk: safe
  related: []
"#;

    let target = Arc::new(ScriptedTarget::new(vec![
        // First observation confirms; the verification poll sees none left.
        (
            "get pods",
            vec![out("pod-a Succeeded", 0), out("", 0)],
        ),
        ("delete pods", vec![out("deleted", 0)]),
    ]));

    let engine = Engine::new(kb_from_yaml(yaml), fast_config(), target as Arc<dyn TargetContext>);
    let session_id = engine
        .start_session(SymptomSet {
            tags: vec!["job_stuck".to_string()],
            signals: Vec::new(),
        })
        .await;

    let final_session = wait_for_terminal(&engine, session_id).await;
    assert_eq!(final_session.status, SessionStatus::Resolved);

    let kinds: Vec<ActionEventKind> = final_session.actions.iter().map(|a| a.kind).collect();
    assert!(kinds.contains(&ActionEventKind::AutoApproved));
    assert!(kinds.contains(&ActionEventKind::VerificationPassed));
    assert!(!kinds.contains(&ActionEventKind::Approved));
}

/// Across every risk class and policy setting, no action reaches
/// Executing without a recorded approval event first, and destructive
/// actions are never auto-approved.
#[tokio::test(flavor = "multi_thread")]
async fn test_no_execution_without_recorded_approval() {
    for risk in ["safe", "moderate", "destructive"] {
        for auto_approve_safe in [true, false] {
            let yaml = format!(
                r#"
- id: single-fix
  title: Single fix entry
  symptoms: [broken]
  causes:
    - id: the-cause
      summary: The cause
      probes:
        - id: check
          command_template: "check-state -n {{{{namespace}}}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "broken"
          timeout_secs: 5
      actions:
        - id: the-fix
          command_template: "apply-fix -n {{{{namespace}}}}"
          risk: {risk}
  related: []
"#
            );

            let target = Arc::new(ScriptedTarget::new(vec![
                ("check-state", vec![out("broken", 0), out("healthy", 0)]),
                ("apply-fix", vec![out("done", 0)]),
            ]));

            let mut config = fast_config();
            config.approval.auto_approve_safe = auto_approve_safe;
            let engine = Engine::new(kb_from_yaml(&yaml), config, Arc::clone(&target) as Arc<dyn TargetContext>);
            let session_id = engine
                .start_session(SymptomSet {
                    tags: vec!["broken".to_string()],
                    signals: Vec::new(),
                })
                .await;

            let auto_path = risk == "safe" && auto_approve_safe;
            if auto_path {
                let final_session = wait_for_terminal(&engine, session_id).await;
                assert_eq!(final_session.status, SessionStatus::Resolved);
            } else {
                // Must stall at the approval gate, not execute.
                wait_for_status(&engine, session_id, SessionStatus::RemediationProposed).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let snapshot = engine.get_status(session_id).await.unwrap();
                assert_eq!(
                    snapshot.status,
                    SessionStatus::RemediationProposed,
                    "risk={risk} auto={auto_approve_safe} executed without approval"
                );
                assert!(!target.commands_run().iter().any(|c| c.contains("apply-fix")));

                engine
                    .approve_action(session_id, "the-fix", Actor::operator("bob"))
                    .await
                    .unwrap();
                wait_for_terminal(&engine, session_id).await;
            }

            // Property: every ExecutionStarted is preceded by an approval
            // record for the same action; destructive is never AutoApproved.
            let final_session = engine.get_status(session_id).await.unwrap();
            for record in final_session
                .actions
                .iter()
                .filter(|r| r.kind == ActionEventKind::ExecutionStarted)
            {
                let approved_before = final_session.actions.iter().any(|r| {
                    r.action_id == record.action_id
                        && r.seq < record.seq
                        && matches!(
                            r.kind,
                            ActionEventKind::Approved | ActionEventKind::AutoApproved
                        )
                });
                assert!(
                    approved_before,
                    "risk={risk}: execution without prior approval record"
                );
            }
            if risk == "destructive" {
                assert!(!final_session
                    .actions
                    .iter()
                    .any(|r| r.kind == ActionEventKind::AutoApproved));
            }
        }
    }
}

/// All causes refuted on the first entry sends the session through the
/// related-entry graph; when the graph is exhausted it escalates with a
/// partial diagnosis, and the visited set stays duplicate-free.
#[tokio::test(flavor = "multi_thread")]
async fn test_graph_navigation_then_partial_diagnosis_escalation() {
    let yaml = r#"
- id: entry-a
  title: First suspicion
  symptoms: [weird, slow]
  causes:
    - id: a-cause
      summary: Something local
      probes:
        - id: a-probe
          command_template: "probe-a -n {{namespace}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "smoking_gun"
          timeout_secs: 5
  related: [entry-b]
- id: entry-b
  title: Second suspicion
  symptoms: [weird]
  causes:
    - id: b-cause
      summary: Something upstream
      probes:
        - id: b-probe
          command_template: "probe-b -n {{namespace}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "smoking_gun"
          timeout_secs: 5
  related: [entry-a]
"#;

    // Clean probe output everywhere: with a zero fail-likelihood a miss
    // refutes the cause outright.
    let target = Arc::new(ScriptedTarget::new(vec![
        ("probe-a", vec![out("all quiet", 0)]),
        ("probe-b", vec![out("all quiet", 0)]),
    ]));

    let mut config = fast_config();
    config.likelihood = LikelihoodConfig {
        fail: 0.0,
        ..LikelihoodConfig::default()
    };

    let engine = Engine::new(kb_from_yaml(yaml), config, target as Arc<dyn TargetContext>);
    let session_id = engine
        .start_session(SymptomSet {
            tags: vec!["weird".to_string(), "slow".to_string()],
            signals: Vec::new(),
        })
        .await;

    let final_session = wait_for_terminal(&engine, session_id).await;
    assert_eq!(final_session.status, SessionStatus::Escalated);
    assert_eq!(
        final_session.visited,
        vec!["entry-a".to_string(), "entry-b".to_string()]
    );

    let escalation = final_session.audit.last().unwrap();
    assert!(escalation.detail.contains("partial diagnosis"));

    // Traversal is bounded by the graph size even though a↔b is a cycle.
    assert!(final_session.visited.len() <= engine.knowledge_base().len());
}

/// Two concurrent sessions over different symptom sets produce disjoint,
/// internally ordered audit logs.
#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_sessions_have_disjoint_audit_logs() {
    let yaml = r#"
- id: latency
  title: Latency
  symptoms: [high_latency]
  causes:
    - id: lat-cause
      summary: Slow backend
      probes:
        - id: lat-probe
          command_template: "check-latency -n {{namespace}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "breach"
          timeout_secs: 5
      actions:
        - id: lat-fix
          command_template: "fix-latency -n {{namespace}}"
          risk: safe
  related: []
- id: crashes
  title: Crashes
  symptoms: [crashloop]
  causes:
    - id: crash-cause
      summary: Bad rollout
      probes:
        - id: crash-probe
          command_template: "check-crashes -n {{namespace}}"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "restarting"
          timeout_secs: 5
      actions:
        - id: crash-fix
          command_template: "fix-crashes -n {{namespace}}"
          risk: safe
  related: []
"#;

    let target = Arc::new(ScriptedTarget::new(vec![
        ("check-latency", vec![out("breach", 0), out("clean", 0)]),
        ("check-crashes", vec![out("restarting", 0), out("clean", 0)]),
        ("fix-latency", vec![out("ok", 0)]),
        ("fix-crashes", vec![out("ok", 0)]),
    ]));

    let engine = Engine::new(kb_from_yaml(yaml), fast_config(), target as Arc<dyn TargetContext>);

    let first = engine
        .start_session(SymptomSet {
            tags: vec!["high_latency".to_string()],
            signals: Vec::new(),
        })
        .await;
    let second = engine
        .start_session(SymptomSet {
            tags: vec!["crashloop".to_string()],
            signals: Vec::new(),
        })
        .await;
    assert_ne!(first, second);

    let first_final = wait_for_terminal(&engine, first).await;
    let second_final = wait_for_terminal(&engine, second).await;
    assert_eq!(first_final.status, SessionStatus::Resolved);
    assert_eq!(second_final.status, SessionStatus::Resolved);

    for (own, other) in [(&first_final, second), (&second_final, first)] {
        assert!(own.audit.iter().all(|r| r.session_id == own.id));
        assert!(own.audit.iter().all(|r| r.session_id != other));
        // Sequence numbers are contiguous from zero: no interleaving and
        // no gaps.
        for (i, record) in own.audit.iter().enumerate() {
            assert_eq!(record.seq, i as u64);
        }
    }
}

/// Cancelling at the approval gate lands the session in Cancelled with
/// the operator recorded.
#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_during_approval_wait() {
    let yaml = r#"
- id: risky
  title: Risky fix entry
  symptoms: [broken]
  causes:
    - id: cause
      summary: The cause
      probes:
        - id: check
          command_template: "check-state"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "broken"
          timeout_secs: 5
      actions:
        - id: dangerous-fix
          command_template: "drop-everything"
          risk: destructive
  related: []
"#;

    let target = Arc::new(ScriptedTarget::new(vec![(
        "check-state",
        vec![out("broken", 0)],
    )]));

    let engine = Engine::new(kb_from_yaml(yaml), fast_config(), Arc::clone(&target) as Arc<dyn TargetContext>);
    let session_id = engine
        .start_session(SymptomSet {
            tags: vec!["broken".to_string()],
            signals: Vec::new(),
        })
        .await;

    wait_for_status(&engine, session_id, SessionStatus::RemediationProposed).await;
    engine
        .cancel(session_id, Actor::operator("carol"))
        .await
        .unwrap();

    let final_session = wait_for_terminal(&engine, session_id).await;
    assert_eq!(final_session.status, SessionStatus::Cancelled);
    assert!(!target.commands_run().iter().any(|c| c.contains("drop-everything")));

    let last = final_session.audit.last().unwrap();
    assert_eq!(last.actor, Actor::operator("carol"));
}

/// An unknown session id is an error, and an archived session still
/// serves snapshots but refuses commands.
#[tokio::test(flavor = "multi_thread")]
async fn test_control_surface_errors() {
    let yaml = r#"
- id: entry
  title: Entry
  symptoms: [tag]
  causes:
    - id: cause
      summary: Cause
      probes:
        - id: probe
          command_template: "probe"
          read_only: true
          expected_signal:
            kind: output_matches
            pattern: "hit"
          timeout_secs: 5
  related: []
"#;

    let target = Arc::new(ScriptedTarget::new(vec![("probe", vec![out("miss", 0)])]));
    let mut config = fast_config();
    config.likelihood.fail = 0.0;
    let engine = Engine::new(kb_from_yaml(yaml), config, target as Arc<dyn TargetContext>);

    assert!(engine
        .get_status(Uuid::new_v4())
        .await
        .is_err());

    let session_id = engine
        .start_session(SymptomSet {
            tags: vec!["tag".to_string()],
            signals: Vec::new(),
        })
        .await;
    let final_session = wait_for_terminal(&engine, session_id).await;
    assert_eq!(final_session.status, SessionStatus::Escalated);

    // Archived: status still readable, commands refused. Give the
    // driver's archival step a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.get_status(session_id).await.is_ok());
    let err = engine
        .cancel(session_id, Actor::operator("dave"))
        .await
        .unwrap_err();
    assert!(matches!(err, medic_engine::SessionError::Archived(_)));
}
