//! Error types for the medic engine.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while loading or validating the knowledge base.
///
/// Per-entry validation failures are not surfaced through this type: the
/// loader excludes the offending entry, logs it, and reports it in the
/// [`crate::knowledge::LoadReport`] instead.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    /// The knowledge base directory could not be read
    #[error("failed to read knowledge base path {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Nothing valid was loaded
    #[error("no valid runbook entries loaded from {path}")]
    Empty {
        /// Knowledge base path
        path: String,
    },
}

/// Errors surfaced by the session control surface.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session with this id exists
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// The session reached a terminal status and was archived; only
    /// `get_status` is valid against it
    #[error("session {0} is archived")]
    Archived(Uuid),

    /// An approval arrived for an action that is not awaiting one
    #[error("session {session_id} has no pending approval for action {action_id}")]
    NoPendingApproval {
        /// Session the approval targeted
        session_id: Uuid,
        /// Action id from the approval request
        action_id: String,
    },

    /// The session driver stopped before the command was handled
    #[error("session {0} is no longer accepting commands")]
    Closed(Uuid),
}

/// Errors from the target-context collaborator.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The command could not be spawned at all
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    /// The collaborator produced output the engine cannot interpret
    #[error("malformed command output: {0}")]
    MalformedOutput(String),
}

/// Errors from executing a remediation (or rollback) command.
#[derive(Debug, Error)]
pub enum RemediationError {
    /// The command template failed to render
    #[error("failed to render action template: {0}")]
    Template(String),

    /// The command ran and exited non-zero
    #[error("action command exited with code {exit_code}")]
    CommandFailed {
        /// Process exit code
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// The command did not finish within the action timeout
    #[error("action command timed out after {0:?}")]
    Timeout(Duration),

    /// The target context failed before the command produced a result
    #[error(transparent)]
    Target(#[from] TargetError),
}
