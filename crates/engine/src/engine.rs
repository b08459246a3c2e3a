//! The engine façade: session lifecycle and control surface.
//!
//! Sessions run independently and in parallel; the only state they share
//! is the probe worker pool, the target-resource lock registry, and the
//! read-only knowledge base. A session that fails never touches its
//! neighbors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock, Semaphore};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::driver::{SessionCommand, SessionDriver};
use crate::error::SessionError;
use crate::executor::{build_vars, ProbeRunner, TargetContext, TargetLocks};
use crate::knowledge::KnowledgeBase;
use crate::matcher::SymptomSet;
use crate::session::{Actor, Session};

/// Live handle to an active session.
struct SessionHandle {
    snapshot: Arc<RwLock<Session>>,
    commands: mpsc::Sender<SessionCommand>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<Uuid, SessionHandle>,
    archived: HashMap<Uuid, Session>,
}

struct EngineInner {
    kb: Arc<KnowledgeBase>,
    config: Arc<EngineConfig>,
    runner: Arc<ProbeRunner>,
    target: Arc<dyn TargetContext>,
    registry: RwLock<Registry>,
}

/// Diagnosis-and-remediation engine over one knowledge base and one
/// target context.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine.
    #[must_use]
    pub fn new(kb: KnowledgeBase, config: EngineConfig, target: Arc<dyn TargetContext>) -> Self {
        let kb = Arc::new(kb);
        let config = Arc::new(config);
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        let locks = Arc::new(TargetLocks::new());
        let runner = Arc::new(ProbeRunner::new(
            Arc::clone(&target),
            workers,
            locks,
            config.retry.clone(),
        ));

        Self {
            inner: Arc::new(EngineInner {
                kb,
                config,
                runner,
                target,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// The loaded knowledge base.
    #[must_use]
    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.inner.kb
    }

    /// Start a session for an observed symptom set and return its id.
    ///
    /// The session runs on its own task; callers follow it through
    /// [`Engine::get_status`].
    pub async fn start_session(&self, symptoms: SymptomSet) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session::new(id, self.inner.target.name(), symptoms);
        let vars = build_vars(
            self.inner.target.as_ref(),
            &session.symptoms,
            &id.to_string(),
        );

        let snapshot = Arc::new(RwLock::new(session.clone()));
        let (commands_tx, commands_rx) = mpsc::channel(16);

        {
            let mut registry = self.inner.registry.write().await;
            registry.active.insert(
                id,
                SessionHandle {
                    snapshot: Arc::clone(&snapshot),
                    commands: commands_tx,
                },
            );
        }

        let driver = SessionDriver::new(
            Arc::clone(&self.inner.kb),
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.runner),
            session,
            snapshot,
            commands_rx,
            vars,
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let final_session = driver.run().await;
            info!(
                session_id = %id,
                status = final_session.status.name(),
                "session closed"
            );
            let mut registry = inner.registry.write().await;
            registry.active.remove(&id);
            registry.archived.insert(id, final_session);
        });

        info!(session_id = %id, "session started");
        id
    }

    /// Snapshot of a session, active or archived.
    pub async fn get_status(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let registry = self.inner.registry.read().await;
        if let Some(handle) = registry.active.get(&session_id) {
            return Ok(handle.snapshot.read().await.clone());
        }
        registry
            .archived
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::UnknownSession(session_id))
    }

    /// Record an approval for the session's pending action.
    pub async fn approve_action(
        &self,
        session_id: Uuid,
        action_id: &str,
        actor: Actor,
    ) -> Result<(), SessionError> {
        let commands = self.command_sender(session_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Approve {
                action_id: action_id.to_string(),
                actor,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed(session_id))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Closed(session_id))?
    }

    /// Cancel a session. Observed at the driver's next checkpoint; an
    /// action already executing finishes first.
    pub async fn cancel(&self, session_id: Uuid, actor: Actor) -> Result<(), SessionError> {
        let commands = self.command_sender(session_id).await?;
        commands
            .send(SessionCommand::Cancel { actor })
            .await
            .map_err(|_| SessionError::Closed(session_id))
    }

    /// Ids of currently active sessions.
    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.inner.registry.read().await.active.keys().copied().collect()
    }

    async fn command_sender(
        &self,
        session_id: Uuid,
    ) -> Result<mpsc::Sender<SessionCommand>, SessionError> {
        let registry = self.inner.registry.read().await;
        if let Some(handle) = registry.active.get(&session_id) {
            return Ok(handle.commands.clone());
        }
        if registry.archived.contains_key(&session_id) {
            return Err(SessionError::Archived(session_id));
        }
        Err(SessionError::UnknownSession(session_id))
    }
}
