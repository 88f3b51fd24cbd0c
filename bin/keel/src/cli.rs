use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use keel_deploy::{ModuleId, SessionId};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Where `deploy` sends its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum NetworkKind {
    /// The JSON-RPC node from the configuration.
    #[default]
    Rpc,
    /// An in-process chain with an in-memory journal. Nothing is sent or written.
    Simulated,
}

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Declarative, resumable contract deployments")]
pub struct Cli {
    /// The verbosity level of the logger.
    #[arg(short, long, env = "KEEL_VERBOSITY", default_value_t = LevelFilter::INFO, global = true)]
    pub verbosity: LevelFilter,

    /// Path to a Keel.toml configuration file, or to a directory containing one.
    ///
    /// Defaults to ./Keel.toml when it exists. Every setting can also be given through a
    /// KEEL_<SETTING> environment variable.
    #[arg(long, alias = "conf", env = "KEEL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute the modules of a manifest, resuming the session if it already exists.
    Deploy(DeployArgs),

    /// Print the execution order of the modules of a manifest without running anything.
    Plan(ManifestArgs),

    /// Print the journal of one or every session.
    Status(StatusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ManifestArgs {
    /// Path to the TOML manifest declaring the modules.
    pub manifest: PathBuf,

    /// Root modules to deploy. Every module of the manifest when omitted.
    #[arg(short, long = "module", value_name = "MODULE")]
    pub modules: Vec<String>,
}

impl ManifestArgs {
    pub fn roots(&self) -> Vec<ModuleId> {
        self.modules.iter().map(ModuleId::new).collect()
    }
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    #[clap(flatten)]
    pub manifest: ManifestArgs,

    /// Session to resume or start. Defaults to chain-<chain id>.
    #[arg(long, env = "KEEL_SESSION")]
    pub session: Option<String>,

    /// JSON-RPC endpoint, overriding the configuration.
    #[arg(long, env = "KEEL_RPC_URL")]
    pub rpc_url: Option<Url>,

    /// Network to deploy to.
    #[arg(long, env = "KEEL_NETWORK", default_value_t = NetworkKind::Rpc)]
    pub network: NetworkKind,

    /// Shorthand for `--network simulated`.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Print the report as JSON instead of a table.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl DeployArgs {
    pub fn network(&self) -> NetworkKind {
        if self.dry_run {
            NetworkKind::Simulated
        } else {
            self.network
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Only show this session.
    #[arg(long, env = "KEEL_SESSION")]
    pub session: Option<String>,
}

impl StatusArgs {
    pub fn session(&self) -> Option<SessionId> {
        self.session.as_deref().map(SessionId::from)
    }
}
