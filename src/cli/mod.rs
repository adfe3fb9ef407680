/*
* CTF Range Manager Command Line Interface
* ----------------------------------------
* @project: ctf-range-manager
*
* Command Structure:
* -----------------
* ctf-range-manager
* ├── serve [--port]                 run the HTTP API
* ├── contest
* │   ├── start <id>                 provision every team x question VM
* │   ├── stop <id>                  shut down + delete the contest's VMs
* │   └── connection <c> <t> <q>     credential and guest IPs for one pair
* ├── vm
* │   ├── sweep --yes                delete every {c}-{t}-{q} VM on the cluster
* │   └── template <vmid>            turn a prepared VM into a question template
* ├── cluster                        nodes and guests as Proxmox sees them
* └── init [--force]                 write config/default.toml
*
* Everything except `init` loads settings the same way the server does, so
* `contest start 7` from a shell behaves exactly like POST /contests/7/start.
* Ctrl-C during a start or stop cancels the run: pairs already in progress
* finish, nothing new is picked up.
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::middleware::rate_limit::mutating_limiter;
use crate::api::{create_router, AppState};
use crate::config::{LoggingSettings, Settings};
use crate::core::proxmox::{HypervisorClient, ProxmoxClient};
use crate::core::snippets;
use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId, VmId};
use crate::orchestrator::{
    ContestOrchestrator, PairOutcome, StartReport, TeardownReport, VmOutcome,
};
use crate::store::{MemoryStore, MySqlStore, PersistenceStore};

#[derive(Parser)]
#[command(name = "ctf-range-manager")]
#[command(about = "Provisions per-team challenge VMs on a Proxmox cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml / local.toml
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start, stop or inspect a contest
    Contest {
        #[command(subcommand)]
        command: ContestCommands,
    },
    /// Cluster-wide VM administration
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// Show nodes and guests
    Cluster,
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ContestCommands {
    /// Provision a VM for every team and question of the contest
    Start { contest_id: ContestId },
    /// Shut down and delete the contest's VMs
    Stop { contest_id: ContestId },
    /// Print the credential and guest addresses for one pair
    Connection {
        contest_id: ContestId,
        team_id: TeamId,
        question_id: QuestionId,
    },
}

#[derive(Subcommand)]
enum VmCommands {
    /// Delete every VM named {contest}-{team}-{question}
    Sweep {
        /// Required; this touches every contest
        #[arg(long)]
        yes: bool,
    },
    /// Convert a prepared VM into a template
    Template { vmid: VmId },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => handle_init_command(cli.config, force),
        Commands::Serve { port } => {
            let settings = load_settings(cli.config)?;
            let port = port.unwrap_or(settings.server.port);
            serve(settings, port).await
        }
        Commands::Contest { command } => {
            let settings = load_settings(cli.config)?;
            let orchestrator = build_orchestrator(&settings).await?;
            handle_contest_command(command, orchestrator).await
        }
        Commands::Vm { command } => {
            let settings = load_settings(cli.config)?;
            let orchestrator = build_orchestrator(&settings).await?;
            handle_vm_command(command, orchestrator).await
        }
        Commands::Cluster => {
            let settings = load_settings(cli.config)?;
            let orchestrator = build_orchestrator(&settings).await?;
            print_cluster(&orchestrator).await
        }
    }
}

/// Loads settings and installs the tracing subscriber they describe.
fn load_settings(config_dir: Option<PathBuf>) -> anyhow::Result<Settings> {
    let settings = match config_dir {
        Some(path) => Settings::from_dir(path),
        None => Settings::new(),
    }
    .context("failed to load configuration")?;
    init_tracing(&settings.logging);
    Ok(settings)
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn build_orchestrator(settings: &Settings) -> anyhow::Result<ContestOrchestrator> {
    let hypervisor: Arc<dyn HypervisorClient> = Arc::new(
        ProxmoxClient::new(&settings.proxmox).context("failed to build Proxmox client")?,
    );
    let snippets = snippets::from_settings(&settings.snippets);

    let store: Arc<dyn PersistenceStore> = if settings.database.url.is_empty() {
        warn!("No database.url configured, records live in memory and vanish on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            MySqlStore::connect(&settings.database)
                .await
                .context("failed to connect to database")?,
        )
    };

    Ok(ContestOrchestrator::new(
        hypervisor,
        snippets,
        store,
        &settings.provisioning,
    ))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            token.cancel();
        }
    });
}

async fn serve(settings: Settings, port: u16) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build_orchestrator(&settings).await?);
    let shutdown = orchestrator.shutdown_token().clone();
    cancel_on_ctrl_c(shutdown.clone());

    let state = Arc::new(AppState::new(
        Arc::clone(&orchestrator),
        mutating_limiter(settings.server.mutating_requests_per_minute),
    ));
    let app = create_router(Arc::clone(&state), &settings.server.api_prefix);

    let addr = format!("{}:{}", settings.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    state.drain().await;
    info!("Server stopped");
    Ok(())
}

async fn handle_contest_command(
    command: ContestCommands,
    orchestrator: ContestOrchestrator,
) -> anyhow::Result<()> {
    cancel_on_ctrl_c(orchestrator.shutdown_token().clone());

    match command {
        ContestCommands::Start { contest_id } => {
            let report = orchestrator.start_contest(contest_id).await?;
            print_start_report(&report);
            report.ensure_success()?;
        }
        ContestCommands::Stop { contest_id } => {
            let report = orchestrator.stop_contest(contest_id).await?;
            print_teardown_report(&report);
            if report.failed() > 0 {
                bail!("{} of {} VMs could not be removed", report.failed(), report.vms.len());
            }
        }
        ContestCommands::Connection {
            contest_id,
            team_id,
            question_id,
        } => {
            let key = ProvisioningKey::new(contest_id, team_id, question_id);
            let record = orchestrator.connection_info(&key).await?;
            println!("{}", format!("Connection for {key}").bold());
            println!("  vm:       {} on {}", record.vmid, record.node);
            println!("  password: {}", record.access.expose());
            if record.ips.is_empty() {
                println!("  ips:      {}", "guest agent not reporting yet".yellow());
            }
            for (iface, ips) in &record.ips {
                println!("  {iface}: {}", ips.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_vm_command(
    command: VmCommands,
    orchestrator: ContestOrchestrator,
) -> anyhow::Result<()> {
    match command {
        VmCommands::Sweep { yes } => {
            if !yes {
                bail!("sweep deletes every contest VM on the cluster; pass --yes to confirm");
            }
            cancel_on_ctrl_c(orchestrator.shutdown_token().clone());
            let report = orchestrator.delete_all_vms().await?;
            print_teardown_report(&report);
        }
        VmCommands::Template { vmid } => {
            orchestrator.templatize(vmid).await?;
            println!("{} VM {} is now a template", "✓".green(), vmid);
        }
    }
    Ok(())
}

async fn print_cluster(orchestrator: &ContestOrchestrator) -> anyhow::Result<()> {
    let snapshot = orchestrator.cluster_snapshot().await?;
    println!("{}", "Nodes:".bold());
    for node in &snapshot.nodes {
        let status = if node.is_online() {
            "online".green()
        } else {
            node.status.as_str().red()
        };
        println!(
            "- {} ({}) cpu {:.0}% mem {}/{} MiB",
            node.node,
            status,
            node.cpu * 100.0,
            node.mem / (1024 * 1024),
            node.maxmem / (1024 * 1024)
        );
    }
    println!("{}", "Guests:".bold());
    for vm in snapshot.vms() {
        let name = vm.name.as_deref().unwrap_or("-");
        let status = match vm.status.as_deref() {
            _ if vm.is_template() => "template".blue(),
            Some("running") => "running".green(),
            Some("stopped") => "stopped".red(),
            other => other.unwrap_or("unknown").yellow(),
        };
        println!(
            "- {} {} on {} ({})",
            vm.vmid.unwrap_or_default(),
            name,
            vm.node.as_deref().unwrap_or("?"),
            status
        );
    }
    Ok(())
}

fn print_start_report(report: &StartReport) {
    println!(
        "{} contest {} run {}",
        "Start".bold(),
        report.contest_id,
        report.run_id
    );
    for pair in &report.pairs {
        let line = match &pair.outcome {
            PairOutcome::Provisioned { vmid, node } => {
                format!("{} provisioned as {vmid} on {node}", "✓".green())
            }
            PairOutcome::AlreadyProvisioned { vmid, recorded } => {
                let note = if *recorded { "" } else { " (no record)" };
                format!("{} already running as {vmid}{note}", "=".blue())
            }
            PairOutcome::InFlight => format!("{} in flight elsewhere", "…".yellow()),
            PairOutcome::Cancelled => format!("{} cancelled", "-".yellow()),
            PairOutcome::Failed { error } => format!("{} {}", "✗".red(), error),
        };
        println!("  {}: {}", pair.key, line);
    }
    println!(
        "{} provisioned, {} already there, {} failed of {}",
        report.provisioned(),
        report.already_provisioned(),
        report.failed(),
        report.total()
    );
}

fn print_teardown_report(report: &TeardownReport) {
    for vm in &report.vms {
        let line = match &vm.outcome {
            VmOutcome::Removed => format!("{} removed", "✓".green()),
            VmOutcome::AlreadyGone => format!("{} already gone", "=".blue()),
            VmOutcome::Cancelled => format!("{} cancelled", "-".yellow()),
            VmOutcome::Failed { error } => format!("{} {}", "✗".red(), error),
        };
        println!("  {} ({}): {}", vm.name, vm.vmid, line);
    }
    println!(
        "{} removed, {} failed of {}",
        report.removed(),
        report.failed(),
        report.vms.len()
    );
}

fn handle_init_command(config_dir: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let config_dir = config_dir.unwrap_or_else(|| PathBuf::from("config"));
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        bail!("{} already exists. Use --force to overwrite.", target.display());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration written to {}", "✓".green(), target.display());
    Ok(())
}
