//! medic-engine: automated diagnosis and remediation over a structured
//! Kubernetes runbook knowledge base.
//!
//! The engine turns runbook entries (symptom signature → candidate causes
//! → diagnostic probes → remediation actions → related entries) into
//! live, auditable incident resolution:
//!
//! - [`matcher`] scores entries against observed symptoms, pure and
//!   deterministic
//! - [`ranker`] keeps Bayesian-style belief scores over candidate causes
//!   as evidence arrives
//! - [`executor`] runs read-only probes with timeouts, bounded retries,
//!   a shared worker pool, and per-resource serialization
//! - [`orchestrator`] drives confirmed hypotheses through gated
//!   remediation, verification, and rollback
//! - [`navigator`] walks the related-runbook graph when every cause of
//!   the active entry is refuted
//! - [`session`] owns per-incident state and the append-only audit trail
//!
//! Cluster access is delegated to a caller-supplied
//! [`executor::TargetContext`]; the engine never assumes an ambient
//! cluster.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use medic_engine::{load_dir, Engine, EngineConfig, SymptomSet};
//! # use medic_engine::executor::TargetContext;
//! # async fn example(target: Arc<dyn TargetContext>) -> Result<(), Box<dyn std::error::Error>> {
//! let (kb, report) = load_dir(Path::new("runbooks"))?;
//! assert!(report.excluded.is_empty());
//!
//! let engine = Engine::new(kb, EngineConfig::default(), target);
//! let session_id = engine
//!     .start_session(SymptomSet {
//!         tags: vec!["high_latency".into()],
//!         signals: Vec::new(),
//!     })
//!     .await;
//! let snapshot = engine.get_status(session_id).await?;
//! println!("{:?}", snapshot.status);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod knowledge;
pub mod matcher;
pub mod navigator;
mod orchestrator;
pub mod ranker;
pub mod session;
mod template;

pub use config::{
    ApprovalPolicy, EngineConfig, LikelihoodConfig, MatcherWeights, RetryConfig,
    VerificationConfig,
};
pub use engine::Engine;
pub use error::{KnowledgeBaseError, RemediationError, SessionError, TargetError};
pub use executor::{CommandOutput, TargetContext, TargetLocks};
pub use knowledge::{
    load_dir, Cause, ExpectedSignal, KnowledgeBase, LoadReport, Probe, RemediationAction,
    RiskClass, RunbookEntry, StructuredSignal,
};
pub use matcher::SymptomSet;
pub use ranker::{HypothesisState, HypothesisStatus};
pub use session::{
    ActionEventKind, ActionRecord, Actor, AuditRecord, Evidence, EvidenceOutcome, Session,
    SessionStatus,
};
