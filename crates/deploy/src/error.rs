//! Error taxonomy of the deployment pipeline.
//!
//! Build and configuration errors are raised before anything reaches the network. Network
//! errors are classified so the engine knows what it may retry. Everything surfaces to the
//! caller as a [`DeployError`].

use std::path::PathBuf;

use alloy_core::primitives::{ChainId, TxHash};
use thiserror::Error;

use crate::artifact::{AccountIndex, ActionId, ModuleId, SessionId};

/// Errors found while turning modules into a schedulable graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// A module transitively depends on itself.
    #[error("cyclic module dependency: {}", join(.cycle))]
    CyclicDependency { cycle: Vec<ModuleId> },

    /// Actions depend on each other in a loop.
    #[error("cyclic action dependency between modules {} (actions: {})", join(.modules), join(.actions))]
    CyclicActions {
        modules: Vec<ModuleId>,
        actions: Vec<ActionId>,
    },

    /// An action reads an artifact that no included action produces.
    #[error("action `{action}` depends on `{reference}`, which no included action produces")]
    UnresolvedReference { action: ActionId, reference: ActionId },

    /// An address was expected but the referenced action produces none.
    #[error("action `{action}` uses `{reference}` as an address, but it is a call")]
    NotAnAddress { action: ActionId, reference: ActionId },

    #[error("unknown module `{0}`")]
    UnknownModule(ModuleId),

    #[error("module id `{0}` must be non-empty and must not contain `#`")]
    InvalidModuleId(ModuleId),

    #[error("module `{0}` is registered twice")]
    DuplicateModule(ModuleId),

    #[error("action id `{0}` is declared twice")]
    DuplicateAction(ActionId),
}

/// Missing or inconsistent external input, detected before any submission.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("external address `{name}` required by `{action}` was not supplied")]
    MissingExternal { action: ActionId, name: String },

    #[error("`{action}` signs with {index}, but only {available} account(s) are configured")]
    UnknownAccount {
        action: ActionId,
        index: AccountIndex,
        available: usize,
    },

    #[error("no artifact named `{name}` (needed by `{action}`)")]
    MissingArtifact { action: ActionId, name: String },

    #[error("library links of `{action}` do not match artifact `{contract}`: {detail}")]
    LibraryLinks {
        action: ActionId,
        contract: String,
        detail: String,
    },

    #[error("payload of `{action}` cannot be encoded: {source}")]
    Encoding {
        action: ActionId,
        #[source]
        source: crate::encoder::EncodeError,
    },

    #[error("session was started on chain {recorded}, but the network reports chain {actual}")]
    ChainMismatch { recorded: ChainId, actual: ChainId },

    #[error(
        "`{action}` changed since it was recorded in session `{session}`; start a new session to redeploy it"
    )]
    JournalMismatch { session: SessionId, action: ActionId },

    #[error("`{action}` is recorded as completed, but its dependency `{dependency}` is not")]
    OrphanedRecord {
        action: ActionId,
        dependency: ActionId,
    },
}

/// Failure reported by a [`crate::Network`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Timeouts and temporary unavailability. Safe to retry.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Deterministic contract-level rejection. Never retried.
    #[error("transaction reverted: {reason}")]
    Revert { reason: String },

    /// The node refused the request for a non-transient reason.
    #[error("rejected by the network: {0}")]
    Rejected(String),

    /// The transaction left the network without being included.
    #[error("transaction {0} was dropped before inclusion")]
    Dropped(TxHash),
}

impl NetworkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Terminal failure of a single action. Completed actions stay valid for a resume.
#[derive(Debug, Error)]
#[error("action `{action}` failed after {} completed action(s): {source}", .completed.len())]
pub struct ExecutionError {
    pub action: ActionId,
    pub completed: Vec<ActionId>,
    #[source]
    pub source: NetworkError,
}

/// Failures of the state journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt journal entry at {}:{line}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{action}` is already completed in session `{session}` and cannot be overwritten")]
    AlreadyCompleted { session: SessionId, action: ActionId },

    #[error("session `{0}` is locked by another run")]
    Locked(SessionId),
}

/// Everything a deployment run can fail with.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("run cancelled after {} completed action(s)", .completed.len())]
    Cancelled { completed: Vec<ActionId> },
}

impl DeployError {
    /// Actions known to be completed when the run stopped.
    pub fn completed(&self) -> &[ActionId] {
        match self {
            Self::Execution(err) => &err.completed,
            Self::Cancelled { completed } => completed,
            _ => &[],
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_modules() {
        let err = BuildError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic module dependency: A -> B -> A");
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(NetworkError::Transient("timeout".into()).is_transient());
        assert!(!NetworkError::Revert { reason: "nope".into() }.is_transient());
        assert!(!NetworkError::Rejected("nonce too low".into()).is_transient());
    }
}
