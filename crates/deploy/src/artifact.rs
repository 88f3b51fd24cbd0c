//! Identities shared by every stage of a deployment.
//!
//! Nothing in here carries behaviour: these are the handles that the graph builder hands out,
//! the scheduler orders, and the engine resolves against the journal.

use std::fmt;

use alloy_core::primitives::Address;
use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

/// Separator between the module id and the local part of an [`ActionId`].
pub const ACTION_ID_SEPARATOR: char = '#';

/// Unique identifier of a [`crate::Module`].
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, Deref, From,
)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier of an action: `<module id>#<local>`.
///
/// The local part is either an explicit override or the in-module action index.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, Deref,
)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Build the id of an action declared by `module`.
    pub fn new(module: &ModuleId, local: impl fmt::Display) -> Self {
        Self(format!("{}{}{}", module, ACTION_ID_SEPARATOR, local))
    }

    /// Parse a fully qualified id such as `ProxyModule#proxy`.
    pub fn parse(id: &str) -> Option<Self> {
        let (module, local) = id.split_once(ACTION_ID_SEPARATOR)?;
        if module.is_empty() || local.is_empty() {
            return None;
        }
        Some(Self(id.to_string()))
    }

    /// The id of the module that declared this action.
    pub fn module(&self) -> ModuleId {
        let module = self
            .0
            .split_once(ACTION_ID_SEPARATOR)
            .map(|(module, _)| module)
            .unwrap_or(&self.0);
        ModuleId::from(module)
    }

    /// The part after the separator.
    pub fn local(&self) -> &str {
        self.0
            .split_once(ACTION_ID_SEPARATOR)
            .map(|(_, local)| local)
            .unwrap_or_default()
    }
}

/// Name of a deployment session. Journal records are keyed by it.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, Deref, From,
)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Default session of a chain: `chain-<id>`.
    pub fn for_chain(chain_id: u64) -> Self {
        Self(format!("chain-{}", chain_id))
    }

    /// Whether the id can be used as a single directory name.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\'])
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Index into the externally supplied, ordered list of signing accounts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From,
)]
#[serde(transparent)]
pub struct AccountIndex(pub usize);

impl fmt::Display for AccountIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account[{}]", self.0)
    }
}

/// Handle to something that will, or already does, exist on-chain.
///
/// An unresolved reference names the action that produces it. A resolved one carries the
/// address; literal addresses enter the graph already resolved and add no dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactReference {
    Unresolved(ActionId),
    Resolved(Address),
}

impl ArtifactReference {
    /// The producing action, if the reference still has to be resolved.
    pub fn producer(&self) -> Option<&ActionId> {
        match self {
            Self::Unresolved(id) => Some(id),
            Self::Resolved(_) => None,
        }
    }
}

impl From<Address> for ArtifactReference {
    fn from(address: Address) -> Self {
        Self::Resolved(address)
    }
}

impl From<ActionId> for ArtifactReference {
    fn from(id: ActionId) -> Self {
        Self::Unresolved(id)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved(id) => write!(f, "{}", id),
            Self::Resolved(address) => write!(f, "{}", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_parts() {
        let id = ActionId::new(&ModuleId::from("ProxyModule"), "proxy");
        assert_eq!(id.as_str(), "ProxyModule#proxy");
        assert_eq!(id.module(), ModuleId::from("ProxyModule"));
        assert_eq!(id.local(), "proxy");
    }

    #[test]
    fn test_action_id_from_index() {
        let id = ActionId::new(&ModuleId::from("VaultSetter"), 2);
        assert_eq!(id.as_str(), "VaultSetter#2");
    }

    #[test]
    fn test_action_id_parse_rejects_malformed() {
        assert!(ActionId::parse("ProxyModule#proxy").is_some());
        assert!(ActionId::parse("ProxyModule").is_none());
        assert!(ActionId::parse("#proxy").is_none());
        assert!(ActionId::parse("ProxyModule#").is_none());
    }

    #[test]
    fn test_session_ids() {
        assert_eq!(SessionId::for_chain(31337).as_str(), "chain-31337");
        assert!(SessionId::from("staging").is_path_safe());
        assert!(!SessionId::from("../etc").is_path_safe());
        assert!(!SessionId::from("..").is_path_safe());
    }

    #[test]
    fn test_literal_reference_has_no_producer() {
        let literal = ArtifactReference::from(Address::repeat_byte(0x11));
        assert!(literal.producer().is_none());

        let id = ActionId::new(&ModuleId::from("A"), 0);
        let pending = ArtifactReference::from(id.clone());
        assert_eq!(pending.producer(), Some(&id));
    }
}
