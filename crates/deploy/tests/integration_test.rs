//! Integration tests for keel-deploy.
//!
//! Every test runs against the in-process `SimulatedNetwork` with a journal in a temporary
//! directory, so no node is needed.
//! Run with: cargo test --test integration_test

use std::{path::Path, time::Duration};

use alloy_core::primitives::Address;
use keel_deploy::{
    ActionId, ArtifactStore, BuildError, DeployError, Deployer, Engine, EngineSettings,
    Environment, ExecutionPlan, Externals, FileJournal, Journal, JournalError, Manifest,
    ModuleId, Network, RecordStatus, SessionId, SessionLock, SimulatedNetwork,
};
use tempdir::TempDir;
use tokio::sync::watch;

const MODULES: &str = r#"
    [[module]]
    id = "A"

    [[module.action]]
    kind = "library"
    id = "L"
    name = "MathLib"

    [[module]]
    id = "B"
    uses = ["A"]

    [[module.action]]
    kind = "contract"
    id = "C"
    name = "Vault"
    libraries = { MathLib = "A#L" }

    [[module]]
    id = "C"
    uses = ["B"]

    [[module.action]]
    kind = "contract"
    id = "P"
    name = "Proxy"
    args = [
        { artifact = "B#C" },
        { account = 0 },
        { encode = { target = "B#C", function = "initialize", args = [{ external = "owner" }] } },
    ]

    [[module]]
    id = "D"
    uses = ["A"]

    [[module.action]]
    kind = "contract"
    id = "registry"
    name = "Registry"
    libraries = { MathLib = "A#L" }
"#;

const CYCLIC_MODULES: &str = r#"
    [[module]]
    id = "X"
    uses = ["Y"]

    [[module.action]]
    kind = "library"
    name = "MathLib"

    [[module]]
    id = "Y"
    uses = ["X"]

    [[module.action]]
    kind = "library"
    name = "MathLib"
"#;

/// `__$…$__` placeholder spanning bytes 1..21 of the linked contracts.
const PLACEHOLDER: &str = "__$0123456789abcdef0123456789abcdef01$__";

const LIB_BYTECODE: &str = "0x600a";
const PROXY_BYTECODE: &str = "0x600b";
const VAULT_OPCODE: u8 = 0x73;
const REGISTRY_OPCODE: u8 = 0x74;

fn write_artifact(dir: &Path, name: &str, abi: &str, bytecode: &str, linked: bool) {
    let link_references = if linked {
        r#"{"contracts/MathLib.sol": {"MathLib": [{"start": 1, "length": 20}]}}"#
    } else {
        "{}"
    };
    let content = format!(
        r#"{{"contractName":"{name}","sourceName":"contracts/{name}.sol","abi":{abi},"bytecode":"{bytecode}","linkReferences":{link_references}}}"#
    );

    let dir = dir.join(format!("contracts/{name}.sol"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{name}.json")), content).unwrap();
    // Debug files next to artifacts are ignored.
    std::fs::write(dir.join(format!("{name}.dbg.json")), r#"{"buildInfo":"x"}"#).unwrap();
}

/// Temporary workspace with compiled artifacts and a deployments directory.
struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new("keel-it").expect("Failed to create temp dir");
        let artifacts = temp_dir.path().join("artifacts");

        write_artifact(&artifacts, "MathLib", "[]", LIB_BYTECODE, false);
        write_artifact(
            &artifacts,
            "Vault",
            r#"[{"type":"function","name":"initialize","stateMutability":"nonpayable","outputs":[],
                 "inputs":[{"name":"owner","type":"address"}]}]"#,
            &format!("0x{:02x}{}6000", VAULT_OPCODE, PLACEHOLDER),
            true,
        );
        write_artifact(
            &artifacts,
            "Registry",
            "[]",
            &format!("0x{:02x}{}6000", REGISTRY_OPCODE, PLACEHOLDER),
            true,
        );
        write_artifact(
            &artifacts,
            "Proxy",
            r#"[{"type":"constructor","stateMutability":"payable",
                 "inputs":[{"name":"logic","type":"address"},{"name":"admin","type":"address"},{"name":"data","type":"bytes"}]}]"#,
            PROXY_BYTECODE,
            false,
        );

        Self { temp_dir }
    }

    fn deployer(&self) -> Deployer {
        let mut externals = Externals::new();
        externals.insert("owner", owner());
        Deployer {
            artifacts: self.temp_dir.path().join("artifacts"),
            deployments: self.temp_dir.path().join("deployments"),
            confirmations: 2,
            max_retries: 2,
            retry_min_delay_ms: 1,
            externals,
            ..Default::default()
        }
    }

    fn journal(&self) -> FileJournal {
        FileJournal::new(self.temp_dir.path().join("deployments"))
    }

    async fn environment(&self, network: &SimulatedNetwork) -> Environment {
        let mut externals = Externals::new();
        externals.insert("owner", owner());
        Environment {
            artifacts: ArtifactStore::load_dir(&self.temp_dir.path().join("artifacts")).unwrap(),
            accounts: network.accounts().await.unwrap(),
            externals,
        }
    }
}

fn owner() -> Address {
    Address::repeat_byte(0x0e)
}

fn settings() -> EngineSettings {
    EngineSettings {
        confirmations: 2,
        max_retries: 2,
        retry_min_delay: Duration::from_millis(1),
    }
}

fn plan(roots: &[&str]) -> ExecutionPlan {
    let manifest = Manifest::from_toml(MODULES).unwrap();
    let roots: Vec<ModuleId> = roots.iter().map(|r| (*r).into()).collect();
    Deployer::plan(&manifest, &roots).unwrap()
}

fn id(id: &str) -> ActionId {
    ActionId::parse(id).unwrap()
}

fn session() -> SessionId {
    SessionId::for_chain(31337)
}

#[tokio::test]
async fn test_library_contract_proxy_deploy_in_order() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());
    let mut journal = ctx.journal();

    let plan = plan(&["C"]);
    let order: Vec<_> = plan.steps().iter().map(|s| s.id().as_str()).collect();
    assert_eq!(order, vec!["A#L", "B#C", "C#P"]);

    let report = engine.run(&plan, &mut journal, &session(), &env).await.unwrap();

    let submissions = engine.network().submissions();
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|tx| tx.is_creation()));
    assert_eq!(submissions[0].data[..], [0x60, 0x0a]);
    assert_eq!(submissions[1].data[0], VAULT_OPCODE);
    assert_eq!(&submissions[2].data[..2], &[0x60, 0x0b]);

    let library = report.address(&id("A#L")).unwrap();
    let vault = report.address(&id("B#C")).unwrap();
    let proxy = report.address(&id("C#P")).unwrap();
    assert_ne!(proxy, vault);
    // The vault was linked against the library that was just deployed.
    assert_eq!(&submissions[1].data[1..21], library.as_slice());

    let records = journal.list(&session()).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
}

#[tokio::test]
async fn test_revert_then_resume_reattempts_only_the_failed_action() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    network.revert_when(|tx| (tx.data.first() == Some(&VAULT_OPCODE)).then(|| "paused".to_string()));
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());
    let mut journal = ctx.journal();
    let plan = plan(&["C"]);

    let err = engine
        .run(&plan, &mut journal, &session(), &env)
        .await
        .unwrap_err();
    match &err {
        DeployError::Execution(failure) => {
            assert_eq!(failure.action, id("B#C"));
            assert_eq!(failure.completed, vec![id("A#L")]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let library = journal.get(&session(), &id("A#L")).unwrap().unwrap();
    assert_eq!(library.status, RecordStatus::Completed);
    let vault = journal.get(&session(), &id("B#C")).unwrap().unwrap();
    assert_eq!(vault.status, RecordStatus::Failed);
    assert!(vault.error.unwrap().contains("paused"));
    assert!(journal.get(&session(), &id("C#P")).unwrap().is_none());
    assert_eq!(engine.network().submission_count(), 2);

    engine.network().clear_reverts();
    let report = engine.run(&plan, &mut journal, &session(), &env).await.unwrap();
    assert_eq!(report.reused(), 1);
    assert_eq!(report.executed(), 2);

    let submissions = engine.network().submissions();
    assert_eq!(submissions.len(), 4);
    assert_eq!(submissions[2].data[0], VAULT_OPCODE);
    assert_eq!(&submissions[3].data[..2], &[0x60, 0x0b]);
    assert_eq!(
        report.address(&id("A#L")),
        Some(library.address.unwrap())
    );
}

#[tokio::test]
async fn test_rerun_of_completed_session_submits_nothing() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());
    let plan = plan(&["C", "D"]);

    let first = engine
        .run(&plan, &mut ctx.journal(), &session(), &env)
        .await
        .unwrap();
    let count = engine.network().submission_count();

    // A fresh journal handle reads the same file.
    let second = engine
        .run(&plan, &mut ctx.journal(), &session(), &env)
        .await
        .unwrap();
    assert_eq!(engine.network().submission_count(), count);
    assert_eq!(second.executed(), 0);
    assert_eq!(first.addresses(), second.addresses());
}

#[tokio::test]
async fn test_shared_module_is_deployed_once() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());

    let plan = plan(&["B", "D"]);
    assert_eq!(plan.len(), 3);

    let report = engine
        .run(&plan, &mut ctx.journal(), &session(), &env)
        .await
        .unwrap();
    let library = report.address(&id("A#L")).unwrap();

    let submissions = engine.network().submissions();
    assert_eq!(submissions.len(), 3);
    let linked: Vec<_> = submissions
        .iter()
        .filter(|tx| matches!(tx.data.first(), Some(&VAULT_OPCODE) | Some(&REGISTRY_OPCODE)))
        .collect();
    assert_eq!(linked.len(), 2);
    for tx in linked {
        assert_eq!(&tx.data[1..21], library.as_slice());
    }
}

#[test]
fn test_cyclic_modules_fail_to_plan() {
    let manifest = Manifest::from_toml(CYCLIC_MODULES).unwrap();
    let err = Deployer::plan(&manifest, &[]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::Build(BuildError::CyclicDependency { .. }))
    ));
}

#[tokio::test]
async fn test_pending_transaction_is_awaited_not_resubmitted() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());
    let mut journal = ctx.journal();
    let plan = plan(&["A"]);

    // One more failure than the retry budget.
    engine.network().fail_waits(3);
    let err = engine
        .run(&plan, &mut journal, &session(), &env)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Execution(_)));

    let record = journal.get(&session(), &id("A#L")).unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Pending);
    assert_eq!(record.nonce, Some(0));
    assert_eq!(engine.network().submission_count(), 1);

    let report = engine.run(&plan, &mut journal, &session(), &env).await.unwrap();
    assert_eq!(engine.network().submission_count(), 1);
    let completed = journal.get(&session(), &id("A#L")).unwrap().unwrap();
    assert_eq!(completed.status, RecordStatus::Completed);
    assert_eq!(completed.tx_hash, record.tx_hash);
    assert_eq!(report.address(&id("A#L")), completed.address);
}

#[tokio::test]
async fn test_cancellation_keeps_the_completed_prefix() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    // Request cancellation while the vault is being deployed.
    network.revert_when(move |tx| {
        if tx.data.first() == Some(&VAULT_OPCODE) {
            let _ = cancel_tx.send(true);
        }
        None
    });
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings()).with_cancellation(cancel_rx);
    let mut journal = ctx.journal();

    let err = engine
        .run(&plan(&["C"]), &mut journal, &session(), &env)
        .await
        .unwrap_err();
    match err {
        DeployError::Cancelled { completed } => {
            assert_eq!(completed, vec![id("A#L"), id("B#C")])
        }
        other => panic!("unexpected error: {other}"),
    }

    let completed: Vec<_> = journal
        .list_completed(&session())
        .unwrap()
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(completed, vec![id("A#L"), id("B#C")]);
    assert!(journal.get(&session(), &id("C#P")).unwrap().is_none());
}

#[tokio::test]
async fn test_deployer_runs_manifest_end_to_end() {
    let ctx = TestContext::new();
    let deployer = ctx.deployer();
    let plan = plan(&["C"]);

    let report = deployer
        .deploy(SimulatedNetwork::default(), &plan, None)
        .await
        .unwrap();
    assert_eq!(report.executed(), 3);

    let session_dir = deployer.deployments.join("chain-31337");
    let addresses: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(session_dir.join("deployed_addresses.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        addresses["C#P"].as_str().unwrap().to_lowercase(),
        report.address(&id("C#P")).unwrap().to_string().to_lowercase()
    );

    // Journal lookups do not depend on the chain's state: a fresh chain reuses everything.
    let again = deployer
        .deploy(SimulatedNetwork::default(), &plan, None)
        .await
        .unwrap();
    assert_eq!(again.executed(), 0);
    assert_eq!(again.addresses(), report.addresses());

    let status = deployer.status(Some(&session())).unwrap();
    assert_eq!(status[0].records.len(), 3);
}

#[tokio::test]
async fn test_locked_session_is_refused() {
    let ctx = TestContext::new();
    let deployer = ctx.deployer();
    let _lock = SessionLock::acquire(&ctx.journal(), &session()).unwrap();

    let err = deployer
        .deploy(SimulatedNetwork::default(), &plan(&["A"]), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::Journal(JournalError::Locked(_)))
    ));
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let ctx = TestContext::new();
    let network = SimulatedNetwork::default();
    let env = ctx.environment(&network).await;
    let engine = Engine::new(network, settings());
    let plan = plan(&["A"]);

    let staging = engine
        .run(&plan, &mut ctx.journal(), &"staging".into(), &env)
        .await
        .unwrap();
    let production = engine
        .run(&plan, &mut ctx.journal(), &"production".into(), &env)
        .await
        .unwrap();

    assert_eq!(engine.network().submission_count(), 2);
    assert_ne!(staging.address(&id("A#L")), production.address(&id("A#L")));
    assert_eq!(
        ctx.journal().sessions().unwrap(),
        vec![SessionId::from("production"), SessionId::from("staging")]
    );
}
