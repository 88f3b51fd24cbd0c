//! Session metadata and the outcome of a run.

use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, ChainId, TxHash};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{ActionId, SessionId},
    error::ConfigurationError,
};

/// Name of the metadata file inside a session directory.
pub const SESSION_FILENAME: &str = "session.json";

/// Name of the address summary written after a successful run.
pub const ADDRESSES_FILENAME: &str = "deployed_addresses.json";

/// Metadata stored alongside a session's journal.
///
/// Written when the session is created and checked on every resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session: SessionId,
    /// Chain the session deploys to. A session never moves between chains.
    pub chain_id: ChainId,
    /// Fingerprint of the execution plan the session was started with.
    pub plan_fingerprint: String,
    pub created_at: DateTime<Utc>,
    /// Keel version that created the session.
    pub keel_version: String,
}

impl SessionMetadata {
    pub fn new(session: SessionId, chain_id: ChainId, plan_fingerprint: String) -> Self {
        Self {
            session,
            chain_id,
            plan_fingerprint,
            created_at: Utc::now(),
            keel_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Save this metadata as formatted JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize session metadata")?;

        std::fs::write(path, json).context(format!(
            "Failed to write session metadata to {}",
            path.display()
        ))?;

        Ok(())
    }

    /// Load metadata from a file.
    ///
    /// Returns `Ok(None)` if the session has never been started.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).context(format!(
            "Failed to read session metadata from {}",
            path.display()
        ))?;

        let metadata: Self =
            serde_json::from_str(&content).context("Failed to parse session metadata JSON")?;

        Ok(Some(metadata))
    }

    /// Check that a resumed session still targets the chain it was started on.
    ///
    /// A different plan is allowed: actions are reconciled one by one against the journal.
    pub fn verify(&self, chain_id: ChainId, plan_fingerprint: &str) -> Result<(), ConfigurationError> {
        if self.chain_id != chain_id {
            return Err(ConfigurationError::ChainMismatch {
                recorded: self.chain_id,
                actual: chain_id,
            });
        }

        if self.plan_fingerprint != plan_fingerprint {
            tracing::info!(
                session = %self.session,
                recorded = %self.plan_fingerprint,
                current = %plan_fingerprint,
                "Execution plan changed since the session was started"
            );
        }

        Ok(())
    }
}

/// One action of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub action: ActionId,
    pub kind: &'static str,
    pub interface: Option<String>,
    pub address: Option<Address>,
    pub tx_hash: Option<TxHash>,
    /// Taken from the journal rather than executed by this run.
    pub reused: bool,
}

/// Everything a successful run produced, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session: SessionId,
    pub entries: Vec<ReportEntry>,
}

impl SessionReport {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    /// Number of actions executed by this run.
    pub fn executed(&self) -> usize {
        self.entries.iter().filter(|e| !e.reused).count()
    }

    /// Number of actions reused from the journal.
    pub fn reused(&self) -> usize {
        self.entries.iter().filter(|e| e.reused).count()
    }

    pub fn address(&self, action: &ActionId) -> Option<Address> {
        self.entries
            .iter()
            .find(|e| &e.action == action)
            .and_then(|e| e.address)
    }

    /// Every produced address, keyed by action id.
    pub fn addresses(&self) -> IndexMap<ActionId, Address> {
        self.entries
            .iter()
            .filter_map(|e| e.address.map(|address| (e.action.clone(), address)))
            .collect()
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Action", "Kind", "Contract", "Address", "Status"]);

        for entry in &self.entries {
            table.add_row(vec![
                entry.action.to_string(),
                entry.kind.to_string(),
                entry.interface.clone().unwrap_or_default(),
                entry.address.map(|a| a.to_string()).unwrap_or_default(),
                if entry.reused { "reused" } else { "executed" }.to_string(),
            ]);
        }

        table
    }

    /// Write `deployed_addresses.json` into `dir`.
    pub fn write_addresses(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(ADDRESSES_FILENAME);
        let json = serde_json::to_string_pretty(&self.addresses())
            .context("Failed to serialize deployed addresses")?;
        std::fs::write(&path, json)
            .context(format!("Failed to write deployed addresses to {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn entry(action: &str, address: Option<Address>, reused: bool) -> ReportEntry {
        ReportEntry {
            action: ActionId::parse(action).unwrap(),
            kind: "contract",
            interface: Some("Vault".to_string()),
            address,
            tx_hash: None,
            reused,
        }
    }

    #[test]
    fn test_metadata_save_and_load() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join(SESSION_FILENAME);

        let original = SessionMetadata::new("chain-1".into(), 1, "ab12".to_string());
        original.save_to_file(&path).expect("Failed to save metadata");

        let loaded = SessionMetadata::load_from_file(&path)
            .expect("Failed to load metadata")
            .expect("Metadata should exist");
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_metadata_missing_file_is_none() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("nonexistent.json");
        assert!(SessionMetadata::load_from_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_metadata_corrupted_file() {
        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join(SESSION_FILENAME);
        std::fs::write(&path, "{ invalid json }").expect("Failed to write corrupted file");

        assert!(SessionMetadata::load_from_file(&path).is_err());
    }

    #[test]
    fn test_chain_mismatch_is_rejected() {
        let metadata = SessionMetadata::new("chain-1".into(), 1, "ab12".to_string());
        assert!(metadata.verify(1, "other").is_ok());
        assert!(matches!(
            metadata.verify(10, "ab12"),
            Err(ConfigurationError::ChainMismatch {
                recorded: 1,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_report_counts_and_addresses() {
        let mut report = SessionReport::new("chain-1".into());
        report.push(entry("M#lib", Some(Address::repeat_byte(1)), true));
        report.push(entry("M#vault", Some(Address::repeat_byte(2)), false));
        report.push(entry("M#init", None, false));

        assert_eq!(report.executed(), 2);
        assert_eq!(report.reused(), 1);
        assert_eq!(report.addresses().len(), 2);
        assert_eq!(
            report.address(&ActionId::parse("M#vault").unwrap()),
            Some(Address::repeat_byte(2))
        );
        assert!(report.table().to_string().contains("M#vault"));

        let temp_dir = TempDir::new("keel-test").expect("Failed to create temp dir");
        let path = report.write_addresses(temp_dir.path()).unwrap();
        let written: IndexMap<String, Address> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(
            written.keys().collect::<Vec<_>>(),
            vec!["M#lib", "M#vault"]
        );
    }
}
