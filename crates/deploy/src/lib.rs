//! keel-deploy - Declarative, resumable contract deployments.
//!
//! Deployments are described as modules of actions (deploy a contract or library, bind an
//! existing address, call a function). Modules are expanded into an action graph, scheduled
//! into a deterministic total order and executed against a [`Network`], with every outcome
//! recorded in a per-session [`Journal`] so an interrupted run resumes where it stopped.

mod artifact;
pub use artifact::{
    ACTION_ID_SEPARATOR, AccountIndex, ActionId, ArtifactReference, ModuleId, SessionId,
};

mod error;
pub use error::{
    BuildError, ConfigurationError, DeployError, ExecutionError, JournalError, NetworkError,
};

mod module;
pub use module::{
    ActionKind, ActionOptions, ActionSpec, AddressSource, Argument, Dependency, EncodedCall,
    Module, ModuleBuilder, ModuleRegistry,
};

pub mod encoder;
pub use encoder::{ArtifactStore, ContractArtifact, EncodeError, ResolvedArgument};

pub mod graph;
pub use graph::{ActionGraph, ExecutionPlan, ExpansionCache, GraphAction, GraphBuilder, schedule};

pub mod journal;
pub use journal::{DeploymentRecord, FileJournal, Journal, MemoryJournal, RecordStatus, SessionLock};

pub mod network;
pub use network::{
    JsonRpcNetwork, Network, PrivateKey, Receipt, SignedTransaction, SimulatedNetwork,
    TransactionRequest,
};

mod engine;
pub use engine::{Engine, EngineSettings, Environment, Externals};

pub mod session;
pub use session::{ReportEntry, SessionMetadata, SessionReport};

pub mod manifest;
pub use manifest::Manifest;

mod deployer;
pub use deployer::{Deployer, KEEL_CONFIG_FILENAME, SessionStatus};
