//! keel deploys contract modules declared in a TOML manifest, and resumes where an interrupted
//! deployment stopped.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use tokio::sync::watch;

use cli::{Cli, Command, DeployArgs, ManifestArgs, NetworkKind, StatusArgs};
use keel_deploy::{DeployError, Deployer, ExecutionPlan, Manifest, SessionId, SessionReport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let deployer = Deployer::load(cli.config.as_deref())?;

    match cli.command {
        Command::Plan(args) => {
            let plan = load_plan(&args)?;
            println!("{}", plan_table(&plan));
            Ok(())
        }
        Command::Deploy(args) => {
            let result = deploy(deployer, &args).await;
            if let Err(err) = &result {
                if let Some(deploy_err) = err.downcast_ref::<DeployError>() {
                    print_failure(deploy_err);
                }
            }
            result
        }
        Command::Status(args) => status(&deployer, &args),
    }
}

fn load_plan(args: &ManifestArgs) -> Result<ExecutionPlan> {
    let manifest = Manifest::load_from_file(&args.manifest)?;
    Deployer::plan(&manifest, &args.roots())
}

async fn deploy(mut deployer: Deployer, args: &DeployArgs) -> Result<()> {
    if let Some(session) = &args.session {
        deployer.session = Some(SessionId::from(session.as_str()));
    }
    if let Some(rpc_url) = &args.rpc_url {
        deployer.rpc_url = rpc_url.clone();
    }

    let plan = load_plan(&args.manifest)?;

    let report = match args.network() {
        NetworkKind::Simulated => {
            tracing::info!(actions = plan.len(), "Dry run against a simulated network...");
            deployer.dry_run(&plan).await?
        }
        NetworkKind::Rpc => {
            tracing::info!(
                rpc_url = %deployer.rpc_url,
                actions = plan.len(),
                "Deploying..."
            );
            let network = deployer.connect().await?;

            // Stop between actions on Ctrl+C; the journal keeps what already completed.
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, stopping after the current action...");
                    let _ = cancel_tx.send(true);
                }
            });

            deployer.deploy(network, &plan, Some(cancel_rx)).await?
        }
    };

    print_report(&report, args.json)
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        let content =
            serde_json::to_string_pretty(report).context("Failed to serialize the report")?;
        println!("{content}");
    } else {
        println!("{}", report.table());
        println!(
            "Session {}: {} action(s) executed, {} reused from the journal",
            report.session,
            report.executed(),
            report.reused()
        );
    }
    Ok(())
}

fn print_failure(err: &DeployError) {
    if let DeployError::Execution(failure) = err {
        eprintln!("Failed action: {}", failure.action);
    }

    let completed = err.completed();
    if !completed.is_empty() {
        eprintln!("Completed before stopping ({}):", completed.len());
        for action in completed {
            eprintln!("  {action}");
        }
        eprintln!("Run the same command again to resume.");
    }
}

fn status(deployer: &Deployer, args: &StatusArgs) -> Result<()> {
    let sessions = deployer.status(args.session().as_ref())?;
    if sessions.is_empty() {
        println!(
            "No sessions under {}",
            deployer.deployments.display()
        );
        return Ok(());
    }

    for session in sessions {
        match &session.metadata {
            Some(metadata) => println!(
                "Session {} (chain {}, started {})",
                session.session, metadata.chain_id, metadata.created_at
            ),
            None => println!("Session {}", session.session),
        }
        println!("{}", session.table());
    }
    Ok(())
}

fn plan_table(plan: &ExecutionPlan) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Action", "Kind", "Contract", "Depends on"]);

    for (position, step) in plan.steps().iter().enumerate() {
        let dependencies = step
            .dependencies
            .iter()
            .map(|dep| dep.producer.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            position.to_string(),
            step.id().to_string(),
            step.spec.kind.label().to_string(),
            step.spec.kind.interface().unwrap_or_default().to_string(),
            dependencies,
        ]);
    }

    table
}
