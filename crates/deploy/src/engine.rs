//! The execution engine.
//!
//! [`Engine::run`] walks an [`ExecutionPlan`] in order against a [`Network`], keeping the
//! [`Journal`] up to date so that an interrupted run can be resumed. A run goes through three
//! phases:
//!
//! 1. **Preflight**: every action is prepared with placeholder addresses. Missing accounts,
//!    externals, artifacts, bad library links and unencodable arguments surface here, before
//!    anything is sent.
//! 2. **Reconciliation**: every completed or pending journal record is checked against the
//!    payload the current definitions would produce.
//! 3. **Execution**: completed actions are skipped, pending ones awaited, the rest signed,
//!    recorded as pending and broadcast. Each action is recorded before the next one starts.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes, TxHash};
use backon::{ExponentialBuilder, Retryable};
use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::{
    artifact::{AccountIndex, ActionId, ArtifactReference, SessionId},
    encoder::{self, ArtifactStore, ContractArtifact, EncodeError, ResolvedArgument},
    error::{ConfigurationError, DeployError, ExecutionError, NetworkError},
    graph::{ExecutionPlan, GraphAction},
    journal::{DeploymentRecord, Journal, RecordStatus},
    module::{ActionKind, AddressSource, Argument},
    network::{Network, Receipt, SignedTransaction, TransactionRequest},
    session::{ReportEntry, SessionReport},
};

/// Default number of confirmations (inclusion counts as one).
pub const DEFAULT_CONFIRMATIONS: u64 = 5;

/// Default number of retries of a transient network failure.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default delay before the first retry. Later retries back off exponentially.
pub const DEFAULT_RETRY_MIN_DELAY: Duration = Duration::from_millis(500);

/// Tunables of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub confirmations: u64,
    pub max_retries: usize,
    pub retry_min_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            confirmations: DEFAULT_CONFIRMATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_min_delay: DEFAULT_RETRY_MIN_DELAY,
        }
    }
}

/// Addresses supplied from outside the module definitions, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, From)]
#[serde(transparent)]
pub struct Externals(BTreeMap<String, Address>);

impl Externals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: Address) -> Option<Address> {
        self.0.insert(name.into(), address)
    }
}

impl FromIterator<(String, Address)> for Externals {
    fn from_iter<I: IntoIterator<Item = (String, Address)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Inputs of a run that do not come from the module definitions.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub artifacts: ArtifactStore,
    /// Signing accounts; an action's sender is an index into this list.
    pub accounts: Vec<Address>,
    pub externals: Externals,
}

/// What executing an action amounts to once its inputs are known.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Prepared {
    Transaction(TransactionRequest),
    /// Bind an address without sending anything.
    Bind(Address),
}

impl Prepared {
    /// SHA-256 over sender, target, value and payload.
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Self::Transaction(tx) => {
                hasher.update(b"tx");
                hasher.update(tx.from.as_slice());
                match tx.to {
                    Some(to) => hasher.update(to.as_slice()),
                    None => hasher.update([0u8]),
                }
                hasher.update(tx.value.to_be_bytes::<32>());
                hasher.update(&tx.data);
            }
            Self::Bind(address) => {
                hasher.update(b"bind");
                hasher.update(address.as_slice());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Turns an action into a [`Prepared`] payload given the addresses known so far.
struct Resolver<'a> {
    plan: &'a ExecutionPlan,
    env: &'a Environment,
    addresses: &'a HashMap<ActionId, Address>,
    /// Substitute the zero address for unknown dependencies (preflight).
    placeholders: bool,
}

impl Resolver<'_> {
    fn prepare(&self, action: &GraphAction) -> Result<Prepared, ConfigurationError> {
        let spec = &action.spec;
        let id = action.id();

        match &spec.kind {
            ActionKind::DeployContract {
                contract,
                args,
                libraries,
            } => {
                let artifact = self.artifact(id, contract)?;
                let libraries = libraries
                    .iter()
                    .map(|(name, reference)| Ok((name.clone(), self.address(id, reference)?)))
                    .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;
                let args = self.arguments(id, args)?;

                let data = encoder::encode_deployment(artifact, &libraries, &args)
                    .map_err(|source| link_error(id, artifact, source))?;
                Ok(Prepared::Transaction(self.transaction(action, None, data)?))
            }
            ActionKind::DeployLibrary { library } => {
                let artifact = self.artifact(id, library)?;
                let data = encoder::encode_deployment(artifact, &BTreeMap::new(), &[])
                    .map_err(|source| link_error(id, artifact, source))?;
                Ok(Prepared::Transaction(self.transaction(action, None, data)?))
            }
            ActionKind::ReferenceExisting { contract, at } => {
                self.artifact(id, contract)?;
                let address = match at {
                    AddressSource::External(name) => self.external(id, name)?,
                    AddressSource::Artifact(reference) => self.address(id, reference)?,
                };
                Ok(Prepared::Bind(address))
            }
            ActionKind::Call {
                target,
                function,
                args,
            } => {
                let to = self.dependency(id, target)?;
                let data = self.encode_call(id, target, function, args)?;
                Ok(Prepared::Transaction(self.transaction(action, Some(to), data)?))
            }
        }
    }

    fn transaction(
        &self,
        action: &GraphAction,
        to: Option<Address>,
        data: Bytes,
    ) -> Result<TransactionRequest, ConfigurationError> {
        Ok(TransactionRequest {
            from: self.account(action.id(), action.spec.from.unwrap_or_default())?,
            to,
            data,
            value: action.spec.value,
        })
    }

    fn artifact(&self, action: &ActionId, name: &str) -> Result<&ContractArtifact, ConfigurationError> {
        self.env
            .artifacts
            .get(name)
            .ok_or_else(|| ConfigurationError::MissingArtifact {
                action: action.clone(),
                name: name.to_string(),
            })
    }

    /// Artifact of the interface bound to `target`'s address.
    fn interface(&self, action: &ActionId, target: &ActionId) -> Result<&ContractArtifact, ConfigurationError> {
        let name = self
            .plan
            .get(target)
            .and_then(|step| step.spec.kind.interface())
            .ok_or_else(|| ConfigurationError::MissingArtifact {
                action: action.clone(),
                name: target.to_string(),
            })?;
        self.artifact(action, name)
    }

    fn account(&self, action: &ActionId, index: AccountIndex) -> Result<Address, ConfigurationError> {
        self.env
            .accounts
            .get(index.0)
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownAccount {
                action: action.clone(),
                index,
                available: self.env.accounts.len(),
            })
    }

    fn external(&self, action: &ActionId, name: &str) -> Result<Address, ConfigurationError> {
        self.env
            .externals
            .get(name)
            .copied()
            .ok_or_else(|| ConfigurationError::MissingExternal {
                action: action.clone(),
                name: name.to_string(),
            })
    }

    fn dependency(&self, action: &ActionId, producer: &ActionId) -> Result<Address, ConfigurationError> {
        match self.addresses.get(producer) {
            Some(address) => Ok(*address),
            None if self.placeholders => Ok(Address::ZERO),
            None => Err(ConfigurationError::OrphanedRecord {
                action: action.clone(),
                dependency: producer.clone(),
            }),
        }
    }

    fn address(&self, action: &ActionId, reference: &ArtifactReference) -> Result<Address, ConfigurationError> {
        match reference {
            ArtifactReference::Resolved(address) => Ok(*address),
            ArtifactReference::Unresolved(producer) => self.dependency(action, producer),
        }
    }

    fn arguments(&self, action: &ActionId, args: &[Argument]) -> Result<Vec<ResolvedArgument>, ConfigurationError> {
        args.iter().map(|arg| self.argument(action, arg)).collect()
    }

    fn argument(&self, action: &ActionId, arg: &Argument) -> Result<ResolvedArgument, ConfigurationError> {
        Ok(match arg {
            Argument::Literal(value) => ResolvedArgument::Literal(value.clone()),
            Argument::Artifact(reference) => ResolvedArgument::Address(self.address(action, reference)?),
            Argument::Account(index) => ResolvedArgument::Address(self.account(action, *index)?),
            Argument::External(name) => ResolvedArgument::Address(self.external(action, name)?),
            Argument::Encoded(call) => ResolvedArgument::Bytes(self.encode_call(
                action,
                &call.target,
                &call.function,
                &call.args,
            )?),
        })
    }

    fn encode_call(
        &self,
        action: &ActionId,
        target: &ActionId,
        function: &str,
        args: &[Argument],
    ) -> Result<Bytes, ConfigurationError> {
        let artifact = self.interface(action, target)?;
        let args = self.arguments(action, args)?;
        encoder::encode_call(&artifact.abi, function, &args).map_err(|source| {
            ConfigurationError::Encoding {
                action: action.clone(),
                source,
            }
        })
    }
}

fn link_error(action: &ActionId, artifact: &ContractArtifact, source: EncodeError) -> ConfigurationError {
    match source {
        EncodeError::MissingLibrary(_) | EncodeError::UnknownLibrary(_) => {
            ConfigurationError::LibraryLinks {
                action: action.clone(),
                contract: artifact.contract_name.clone(),
                detail: source.to_string(),
            }
        }
        source => ConfigurationError::Encoding {
            action: action.clone(),
            source,
        },
    }
}

/// Executes plans against a [`Network`].
#[derive(Debug)]
pub struct Engine<N> {
    network: N,
    settings: EngineSettings,
    cancel: Option<watch::Receiver<bool>>,
}

impl<N: Network> Engine<N> {
    pub fn new(network: N, settings: EngineSettings) -> Self {
        Self {
            network,
            settings,
            cancel: None,
        }
    }

    /// Stop before the next action once `true` is sent on the channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Execute `plan` within `session`, resuming from whatever the journal holds.
    pub async fn run<J: Journal>(
        &self,
        plan: &ExecutionPlan,
        journal: &mut J,
        session: &SessionId,
        env: &Environment,
    ) -> Result<SessionReport, DeployError> {
        tracing::info!(session = %session, actions = plan.len(), "Starting execution");

        self.preflight(plan, env)?;
        let records: HashMap<ActionId, DeploymentRecord> = journal
            .list(session)?
            .into_iter()
            .map(|record| (record.action.clone(), record))
            .collect();
        let mut addresses = self.reconcile(plan, env, session, &records)?;

        let mut report = SessionReport::new(session.clone());
        let mut completed: Vec<ActionId> = plan
            .steps()
            .iter()
            .filter(|step| records.get(step.id()).is_some_and(DeploymentRecord::is_completed))
            .map(|step| step.id().clone())
            .collect();

        for step in plan.steps() {
            let id = step.id();

            if let Some(record) = records.get(id).filter(|r| r.is_completed()) {
                tracing::debug!(action = %id, "Already completed, skipping");
                report.push(entry(step, record.address, record.tx_hash, true));
                continue;
            }

            if self.cancelled() {
                tracing::warn!(completed = completed.len(), "Run cancelled");
                return Err(DeployError::Cancelled { completed });
            }

            let pending = records
                .get(id)
                .filter(|r| r.status == RecordStatus::Pending)
                .and_then(|r| r.tx_hash.map(|hash| (hash, r.nonce, r.fingerprint.clone())));

            let (tx_hash, nonce, fingerprint) = match pending {
                Some((tx_hash, nonce, fingerprint)) => {
                    tracing::info!(action = %id, tx_hash = %tx_hash, "Resuming pending transaction");
                    (tx_hash, nonce, fingerprint)
                }
                None => {
                    let resolver = Resolver {
                        plan,
                        env,
                        addresses: &addresses,
                        placeholders: false,
                    };
                    let prepared = resolver.prepare(step)?;
                    let fingerprint = prepared.fingerprint();

                    match prepared {
                        Prepared::Bind(address) => {
                            journal.put(
                                session,
                                DeploymentRecord::completed(
                                    id.clone(),
                                    fingerprint,
                                    Some(address),
                                    None,
                                ),
                            )?;
                            tracing::info!(action = %id, address = %address, "Bound existing contract");
                            addresses.insert(id.clone(), address);
                            completed.push(id.clone());
                            report.push(entry(step, Some(address), None, false));
                            continue;
                        }
                        Prepared::Transaction(tx) => {
                            let signed = self
                                .send(journal, session, id, &fingerprint, &tx, &completed)
                                .await?;
                            (signed.hash, Some(signed.nonce), fingerprint)
                        }
                    }
                }
            };

            let confirmations = self.settings.confirmations;
            let outcome = self
                .retrying(id, "wait", || {
                    self.network.wait_for_confirmation(tx_hash, confirmations)
                })
                .await
                .and_then(|receipt| settle(step, receipt));

            match outcome {
                Ok(address) => {
                    journal.put(
                        session,
                        DeploymentRecord::completed(id.clone(), fingerprint, address, Some(tx_hash))
                            .with_nonce(nonce),
                    )?;
                    match address {
                        Some(address) => {
                            tracing::info!(action = %id, address = %address, tx_hash = %tx_hash, "Action completed");
                            addresses.insert(id.clone(), address);
                        }
                        None => tracing::info!(action = %id, tx_hash = %tx_hash, "Action completed"),
                    }
                    completed.push(id.clone());
                    report.push(entry(step, address, Some(tx_hash), false));
                }
                Err(source) if source.is_transient() => {
                    // Left pending: the next run waits for this transaction instead of resending it.
                    tracing::warn!(action = %id, tx_hash = %tx_hash, error = %source, "Confirmation not observed, leaving pending");
                    return Err(failure(id, &completed, source));
                }
                Err(source) => {
                    journal.put(
                        session,
                        DeploymentRecord::failed(id.clone(), fingerprint, Some(tx_hash), &source)
                            .with_nonce(nonce),
                    )?;
                    tracing::error!(action = %id, tx_hash = %tx_hash, error = %source, "Action failed");
                    return Err(failure(id, &completed, source));
                }
            }
        }

        tracing::info!(
            session = %session,
            executed = report.executed(),
            reused = report.reused(),
            "Execution finished"
        );
        Ok(report)
    }

    /// Sign `tx`, record it as pending, then broadcast it.
    ///
    /// The signature pins the nonce, so a retried broadcast resends the very same transaction
    /// and can never land twice.
    async fn send<J: Journal>(
        &self,
        journal: &mut J,
        session: &SessionId,
        id: &ActionId,
        fingerprint: &str,
        tx: &TransactionRequest,
        completed: &[ActionId],
    ) -> Result<SignedTransaction, DeployError> {
        tracing::debug!(
            action = %id,
            from = %tx.from,
            payload_bytes = tx.data.len(),
            "Signing transaction"
        );
        let signed = match self.retrying(id, "sign", || self.network.sign(tx)).await {
            Ok(signed) => signed,
            Err(source) => {
                journal.put(
                    session,
                    DeploymentRecord::failed(id.clone(), fingerprint.to_string(), None, &source),
                )?;
                tracing::error!(action = %id, error = %source, "Signing failed");
                return Err(failure(id, completed, source));
            }
        };

        journal.put(
            session,
            DeploymentRecord::pending(id.clone(), fingerprint.to_string(), signed.hash)
                .with_nonce(Some(signed.nonce)),
        )?;

        match self
            .retrying(id, "broadcast", || self.network.broadcast(&signed))
            .await
        {
            Ok(_) => {
                tracing::debug!(action = %id, tx_hash = %signed.hash, nonce = signed.nonce, "Transaction broadcast");
                Ok(signed)
            }
            Err(source) if source.is_transient() => {
                // Left pending: the next run asks the network whether it arrived.
                tracing::warn!(action = %id, tx_hash = %signed.hash, error = %source, "Broadcast not acknowledged, leaving pending");
                Err(failure(id, completed, source))
            }
            Err(source) => {
                journal.put(
                    session,
                    DeploymentRecord::failed(
                        id.clone(),
                        fingerprint.to_string(),
                        Some(signed.hash),
                        &source,
                    )
                    .with_nonce(Some(signed.nonce)),
                )?;
                tracing::error!(action = %id, tx_hash = %signed.hash, error = %source, "Broadcast rejected");
                Err(failure(id, completed, source))
            }
        }
    }

    /// Prepare every action with placeholder addresses.
    fn preflight(&self, plan: &ExecutionPlan, env: &Environment) -> Result<(), ConfigurationError> {
        let addresses = HashMap::new();
        let resolver = Resolver {
            plan,
            env,
            addresses: &addresses,
            placeholders: true,
        };
        for step in plan.steps() {
            resolver.prepare(step)?;
        }
        tracing::debug!(actions = plan.len(), "Preflight passed");
        Ok(())
    }

    /// Check completed and pending records against the current definitions.
    ///
    /// Returns the addresses produced by completed actions.
    fn reconcile(
        &self,
        plan: &ExecutionPlan,
        env: &Environment,
        session: &SessionId,
        records: &HashMap<ActionId, DeploymentRecord>,
    ) -> Result<HashMap<ActionId, Address>, ConfigurationError> {
        let mut addresses = HashMap::new();

        for step in plan.steps() {
            let Some(record) = records.get(step.id()) else {
                continue;
            };
            if record.status == RecordStatus::Failed {
                continue;
            }

            let resolver = Resolver {
                plan,
                env,
                addresses: &addresses,
                placeholders: false,
            };
            if resolver.prepare(step)?.fingerprint() != record.fingerprint {
                return Err(ConfigurationError::JournalMismatch {
                    session: session.clone(),
                    action: step.id().clone(),
                });
            }

            if let (RecordStatus::Completed, Some(address)) = (record.status, record.address) {
                addresses.insert(step.id().clone(), address);
            }
        }

        Ok(addresses)
    }

    async fn retrying<T, F, Fut>(
        &self,
        action: &ActionId,
        operation: &'static str,
        f: F,
    ) -> Result<T, NetworkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_min_delay)
            .with_max_times(self.settings.max_retries);

        f.retry(backoff)
            .sleep(tokio::time::sleep)
            .when(NetworkError::is_transient)
            .notify(|err: &NetworkError, delay: Duration| {
                tracing::warn!(
                    action = %action,
                    operation,
                    error = %err,
                    delay = ?delay,
                    "Transient network error, retrying"
                );
            })
            .await
    }
}

/// Map a receipt to the produced address, checking it matches what the action produces.
fn settle(step: &GraphAction, receipt: Receipt) -> Result<Option<Address>, NetworkError> {
    match (receipt, step.spec.kind.produces_address()) {
        (Receipt::Created(address), true) => Ok(Some(address)),
        (Receipt::Executed, false) => Ok(None),
        (Receipt::Reverted(reason), _) => Err(NetworkError::Revert { reason }),
        (Receipt::Created(_), false) => Err(NetworkError::Rejected(
            "call unexpectedly created a contract".to_string(),
        )),
        (Receipt::Executed, true) => Err(NetworkError::Rejected(
            "creation transaction produced no contract".to_string(),
        )),
    }
}

fn failure(action: &ActionId, completed: &[ActionId], source: NetworkError) -> DeployError {
    ExecutionError {
        action: action.clone(),
        completed: completed.to_vec(),
        source,
    }
    .into()
}

fn entry(step: &GraphAction, address: Option<Address>, tx_hash: Option<TxHash>, reused: bool) -> ReportEntry {
    ReportEntry {
        action: step.id().clone(),
        kind: step.spec.kind.label(),
        interface: step.spec.kind.interface().map(str::to_string),
        address,
        tx_hash,
        reused,
    }
}
