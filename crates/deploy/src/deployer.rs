//! Deployer configuration and the entry points used by the `keel` binary.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::{Address, ChainId};
use anyhow::{Context, Result};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;

use crate::{
    artifact::{ModuleId, SessionId},
    encoder::ArtifactStore,
    engine::{
        DEFAULT_CONFIRMATIONS, DEFAULT_MAX_RETRIES, Engine, EngineSettings, Environment, Externals,
    },
    error::{ConfigurationError, DeployError},
    graph::{ExecutionPlan, GraphBuilder, schedule},
    journal::{DeploymentRecord, FileJournal, Journal, MemoryJournal, SessionLock},
    manifest::Manifest,
    network::{
        JsonRpcNetwork, Network, PrivateKey, RpcSettings, SIMULATED_CHAIN_ID, SimulatedNetwork,
    },
    session::{SESSION_FILENAME, SessionMetadata, SessionReport},
};

/// Default name of the configuration file.
pub const KEEL_CONFIG_FILENAME: &str = "Keel.toml";

/// Node used when no `rpc_url` is configured.
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";

/// How long [`Deployer::connect`] waits for the node to answer.
const NODE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Accounts a dry run signs with when none are configured.
const DRY_RUN_ACCOUNTS: usize = 4;

/// The main deployer configuration.
///
/// Every field has a default, so an empty `Keel.toml` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployer {
    /// JSON-RPC endpoint of the node that signs and mines transactions.
    pub rpc_url: Url,

    /// Chain id the node must report. Unchecked when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,

    /// Directory holding compiled artifacts.
    pub artifacts: PathBuf,

    /// Directory holding one sub-directory per session.
    pub deployments: PathBuf,

    /// Session to resume. Defaults to `chain-<chain id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,

    /// Confirmations required before an action counts as completed.
    pub confirmations: u64,

    pub max_retries: usize,

    pub retry_min_delay_ms: u64,

    /// Receipt polling interval.
    pub poll_interval_ms: u64,

    pub confirmation_timeout_secs: u64,

    /// Signing accounts. When empty, the accounts of `private_keys` are used, or the accounts
    /// unlocked on the node when there are no keys either.
    pub accounts: Vec<Address>,

    /// Hex private keys of accounts signed for locally. Other senders are signed for by the
    /// node. Read from the file or `KEEL_PRIVATE_KEYS`, never written back.
    #[serde(skip_serializing)]
    pub private_keys: Vec<PrivateKey>,

    /// Addresses that exist outside the modules, by name.
    pub externals: Externals,
}

impl Default for Deployer {
    fn default() -> Self {
        let rpc = RpcSettings::default();
        let engine = EngineSettings::default();
        Self {
            rpc_url: Url::parse(DEFAULT_RPC_URL).expect("default rpc url is valid"),
            chain_id: None,
            artifacts: PathBuf::from("artifacts"),
            deployments: PathBuf::from("deployments"),
            session: None,
            confirmations: DEFAULT_CONFIRMATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_min_delay_ms: engine.retry_min_delay.as_millis() as u64,
            poll_interval_ms: rpc.poll_interval.as_millis() as u64,
            confirmation_timeout_secs: rpc.confirmation_timeout.as_secs(),
            accounts: Vec::new(),
            private_keys: Vec::new(),
            externals: Externals::default(),
        }
    }
}

/// Journal contents of one session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub session: SessionId,
    pub metadata: Option<SessionMetadata>,
    pub records: Vec<DeploymentRecord>,
}

impl SessionStatus {
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Action", "Status", "Address", "Transaction", "Error"]);

        for record in &self.records {
            table.add_row(vec![
                record.action.to_string(),
                record.status.to_string(),
                record.address.map(|a| a.to_string()).unwrap_or_default(),
                record.tx_hash.map(|h| h.to_string()).unwrap_or_default(),
                record.error.clone().unwrap_or_default(),
            ]);
        }

        table
    }
}

impl Deployer {
    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployer config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, or from `Keel.toml` inside a directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let content = std::fs::read_to_string(config_path(path))
            .context(format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Defaults, overridden by the TOML file (when it exists), overridden by `KEEL_*`
    /// environment variables.
    ///
    /// Without an explicit path, `Keel.toml` in the working directory is used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(config_path)
            .unwrap_or_else(|| PathBuf::from(KEEL_CONFIG_FILENAME));
        if path.is_some() && !file.exists() {
            anyhow::bail!("Configuration file not found: {}", file.display());
        }

        let config: Self = Self::figment(&file, Env::prefixed("KEEL_"))
            .extract()
            .context(format!("Failed to load configuration from {}", file.display()))?;
        tracing::debug!(path = %file.display(), rpc_url = %config.rpc_url, "Configuration resolved");
        Ok(config)
    }

    fn figment(file: &Path, env: Env) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(env)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            confirmations: self.confirmations,
            max_retries: self.max_retries,
            retry_min_delay: Duration::from_millis(self.retry_min_delay_ms),
        }
    }

    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
        }
    }

    /// Build the execution plan of `roots`, or of every module of the manifest when no root
    /// is given.
    pub fn plan(manifest: &Manifest, roots: &[ModuleId]) -> Result<ExecutionPlan> {
        let registry = manifest.to_registry()?;
        let roots = if roots.is_empty() {
            manifest.module_ids()
        } else {
            roots.to_vec()
        };

        let graph = GraphBuilder::new(&registry)
            .build(&roots)
            .map_err(DeployError::from)?;
        let plan = schedule(graph).map_err(DeployError::from)?;

        tracing::info!(
            modules = plan.modules().len(),
            actions = plan.len(),
            fingerprint = %plan.fingerprint(),
            "Execution plan built"
        );
        Ok(plan)
    }

    /// Connect to the configured node and wait until it answers.
    pub async fn connect(&self) -> Result<JsonRpcNetwork> {
        let signers = self
            .private_keys
            .iter()
            .enumerate()
            .map(|(index, key)| key.signer().context(format!("private_keys[{}]", index)))
            .collect::<Result<Vec<_>>>()?;
        if !signers.is_empty() {
            tracing::info!(signers = signers.len(), "Signing locally");
        }

        let network =
            JsonRpcNetwork::new(self.rpc_url.clone(), self.rpc_settings())?.with_signers(signers);
        network
            .wait_until_ready(NODE_READY_TIMEOUT)
            .await
            .context(format!("Node at {} is not reachable", self.rpc_url))?;
        Ok(network)
    }

    /// Load artifacts and collect the signing accounts.
    pub async fn environment<N: Network>(&self, network: &N) -> Result<Environment> {
        let artifacts = ArtifactStore::load_dir(&self.artifacts).context(format!(
            "Failed to load artifacts from {}",
            self.artifacts.display()
        ))?;

        let accounts = if self.accounts.is_empty() {
            network
                .accounts()
                .await
                .context("Failed to list the node's accounts")?
        } else {
            self.accounts.clone()
        };

        tracing::debug!(
            artifacts = artifacts.len(),
            accounts = accounts.len(),
            externals = self.externals.len(),
            "Environment ready"
        );

        Ok(Environment {
            artifacts,
            accounts,
            externals: self.externals.clone(),
        })
    }

    fn session_for(&self, chain_id: ChainId) -> SessionId {
        self.session
            .clone()
            .unwrap_or_else(|| SessionId::for_chain(chain_id))
    }

    /// Execute `plan` against `network` in a journaled session under `deployments`.
    ///
    /// The session is locked for the whole run and `deployed_addresses.json` is written next
    /// to its journal on success. Typed failures are returned as [`DeployError`] inside the
    /// `anyhow::Error`.
    pub async fn deploy<N: Network>(
        &self,
        network: N,
        plan: &ExecutionPlan,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<SessionReport> {
        let chain_id = network
            .chain_id()
            .await
            .context("Failed to query the chain id")?;
        if let Some(expected) = self.chain_id {
            if expected != chain_id {
                return Err(DeployError::from(ConfigurationError::ChainMismatch {
                    recorded: expected,
                    actual: chain_id,
                })
                .into());
            }
        }

        let session = self.session_for(chain_id);
        let mut journal = FileJournal::new(&self.deployments);
        let _lock = SessionLock::acquire(&journal, &session).map_err(DeployError::from)?;

        let session_dir = journal.session_dir(&session).map_err(DeployError::from)?;
        let metadata_path = session_dir.join(SESSION_FILENAME);
        let fingerprint = plan.fingerprint();
        match SessionMetadata::load_from_file(&metadata_path)? {
            Some(metadata) => metadata
                .verify(chain_id, &fingerprint)
                .map_err(DeployError::from)?,
            None => {
                tracing::info!(session = %session, chain_id, "Starting a new session");
                SessionMetadata::new(session.clone(), chain_id, fingerprint)
                    .save_to_file(&metadata_path)?;
            }
        }

        let env = self.environment(&network).await?;
        let mut engine = Engine::new(network, self.engine_settings());
        if let Some(cancel) = cancel {
            engine = engine.with_cancellation(cancel);
        }

        let report = engine.run(plan, &mut journal, &session, &env).await?;
        let addresses = report.write_addresses(&session_dir)?;

        tracing::info!(
            session = %session,
            executed = report.executed(),
            reused = report.reused(),
            addresses = %addresses.display(),
            "Deployment complete"
        );
        Ok(report)
    }

    /// Run `plan` against a [`SimulatedNetwork`] with an in-memory journal.
    ///
    /// Nothing is written to disk and no node is contacted.
    pub async fn dry_run(&self, plan: &ExecutionPlan) -> Result<SessionReport> {
        let chain_id = self.chain_id.unwrap_or(SIMULATED_CHAIN_ID);
        let signers = self.accounts.len().max(DRY_RUN_ACCOUNTS);
        let network = SimulatedNetwork::new(chain_id, u8::try_from(signers).unwrap_or(u8::MAX));

        let mut env = self.environment(&network).await?;
        env.accounts = network.accounts().await?;

        let settings = EngineSettings {
            retry_min_delay: Duration::ZERO,
            ..self.engine_settings()
        };
        let session = self.session_for(chain_id);
        let report = Engine::new(network, settings)
            .run(plan, &mut MemoryJournal::new(), &session, &env)
            .await?;

        tracing::info!(
            session = %session,
            actions = report.entries.len(),
            "Dry run complete"
        );
        Ok(report)
    }

    /// Journal contents of `session`, or of every session when `None`.
    pub fn status(&self, session: Option<&SessionId>) -> Result<Vec<SessionStatus>> {
        let journal = FileJournal::new(&self.deployments);
        let sessions = match session {
            Some(session) => vec![session.clone()],
            None => journal.sessions()?,
        };

        sessions
            .into_iter()
            .map(|session| -> Result<SessionStatus> {
                let dir = journal.session_dir(&session)?;
                let metadata = SessionMetadata::load_from_file(&dir.join(SESSION_FILENAME))?;
                let records = journal.list(&session)?;
                Ok(SessionStatus {
                    session,
                    metadata,
                    records,
                })
            })
            .collect()
    }
}

fn config_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(KEEL_CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    }
}
