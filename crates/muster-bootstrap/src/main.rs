//! Muster binary
//!
//! Bootstraps one member of a group, hosts a pure controller, or checks a
//! host's connectivity.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use muster_bootstrap::{
    bootstrap, resolve_endpoint, run_diagnostics, BootstrapConfig, LauncherEnv, NetworkConnector, PureController,
    StrategyKind,
};
use muster_group::{Backend, ControllerMode};
use muster_net::{AddressResolver, PeerAddress, ProbeConfig, Prober};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about = "Rendezvous and collective bootstrap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a group, validate it, then wait for Ctrl-C
    Join(JoinArgs),
    /// Host the rendezvous store without joining the group
    Controller(ControllerArgs),
    /// Check that an address accepts TCP connections
    Probe(ProbeArgs),
    /// Report this host's address, ports and store health
    Diagnose(DiagnoseArgs),
}

#[derive(Args)]
struct JoinArgs {
    /// Rank of this process. Falls back to RANK
    #[arg(long, env = "MUSTER_RANK")]
    rank: Option<u32>,

    /// Number of processes in the group. Falls back to WORLD_SIZE
    #[arg(long, env = "MUSTER_WORLD_SIZE")]
    world_size: Option<u32>,

    /// Address rank 0 listens on for a direct handshake (host:port)
    #[arg(long, env = "MUSTER_COORDINATOR")]
    coordinator: Option<String>,

    /// Address of the rendezvous store (host:port)
    #[arg(long, env = "MUSTER_CONTROLLER")]
    controller: Option<String>,

    /// Marker file for single-host rendezvous
    #[arg(long, env = "MUSTER_RENDEZVOUS_FILE")]
    rendezvous_file: Option<PathBuf>,

    /// Collective backend
    #[arg(long, env = "MUSTER_BACKEND", default_value = "tcp")]
    backend: String,

    /// Who hosts the store: member (rank 0) or pure (external controller)
    #[arg(long, env = "MUSTER_CONTROLLER_MODE", default_value = "member")]
    controller_mode: String,

    /// Address other members use to reach this one
    #[arg(long, env = "MUSTER_ADVERTISE")]
    advertise: Option<Ipv4Addr>,

    /// Bound for each rendezvous attempt, in seconds
    #[arg(long, env = "MUSTER_ATTEMPT_TIMEOUT", default_value = "30")]
    attempt_timeout_secs: u64,

    /// Total time to keep polling an unreachable peer, in seconds
    #[arg(long, env = "MUSTER_PROBE_BUDGET", default_value = "30")]
    probe_budget_secs: u64,

    /// Polling interval, in milliseconds
    #[arg(long, env = "MUSTER_PROBE_INTERVAL", default_value = "1000")]
    probe_interval_ms: u64,

    /// Strategy order, comma separated (direct, implicit, store, file)
    #[arg(long, env = "MUSTER_STRATEGIES", value_delimiter = ',')]
    strategies: Option<Vec<String>>,

    /// Tear down right after validation instead of waiting for Ctrl-C
    #[arg(long, default_value = "false")]
    exit_after_validate: bool,
}

#[derive(Args)]
struct ControllerArgs {
    /// Address to bind the store on
    #[arg(long, env = "MUSTER_CONTROLLER_BIND", default_value = "0.0.0.0:29500")]
    bind: String,

    /// Number of members expected
    #[arg(long, env = "MUSTER_WORLD_SIZE")]
    world_size: u32,

    /// How long to wait for every member to register, in seconds
    #[arg(long, default_value = "300")]
    join_timeout_secs: u64,

    /// How long to wait for every member to disband, in seconds. Unbounded when unset
    #[arg(long)]
    disband_timeout_secs: Option<u64>,
}

#[derive(Args)]
struct ProbeArgs {
    /// Address to probe (host:port)
    address: String,

    /// Number of attempts
    #[arg(long, default_value = "3")]
    attempts: u32,

    /// Timeout for one attempt, in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Polling interval, in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,
}

#[derive(Args)]
struct DiagnoseArgs {
    /// Rendezvous port to check
    #[arg(long, default_value = "29500")]
    port: u16,

    /// Controller to probe (host:port)
    #[arg(long, env = "MUSTER_CONTROLLER")]
    controller: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "muster=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Join(args) => join(args).await,
        Command::Controller(args) => controller(args).await,
        Command::Probe(args) => probe(args).await,
        Command::Diagnose(args) => diagnose(args).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            // Negotiation failures carry their own report.
            match e.downcast_ref::<muster_bootstrap::Error>().and_then(|e| e.diagnosis()) {
                Some(diagnosis) => eprintln!("{diagnosis}"),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn join(args: JoinArgs) -> anyhow::Result<ExitCode> {
    let launcher = LauncherEnv::capture();
    let config = build_config(&args, &launcher).await?;
    info!(rank = config.rank(), world_size = config.world_size(), "Starting bootstrap");

    let connector = NetworkConnector::new(&config, launcher);
    let (mut session, report) = tokio::select! {
        joined = bootstrap(&config, connector) => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during bootstrap");
            return Ok(ExitCode::from(130));
        }
    };
    for outcome in &report.outcomes {
        info!(check = %outcome.check, passed = outcome.passed, elapsed = ?outcome.elapsed, "Validation check");
    }

    if !args.exit_after_validate {
        info!(rank = session.rank(), "Group ready; press Ctrl-C to leave");
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        info!("Leaving group");
    }

    session.teardown().await.context("teardown")?;
    Ok(ExitCode::SUCCESS)
}

async fn build_config(args: &JoinArgs, launcher: &LauncherEnv) -> anyhow::Result<BootstrapConfig> {
    let interval = Duration::from_millis(args.probe_interval_ms);
    let probe = ProbeConfig::default()
        .with_interval(interval)
        .with_budget(Duration::from_secs(args.probe_budget_secs));

    let mut config = BootstrapConfig::from_launcher(args.rank, args.world_size, launcher)?
        .with_backend(args.backend.parse::<Backend>()?)
        .with_controller_mode(args.controller_mode.parse::<ControllerMode>()?)
        .with_attempt_timeout(Duration::from_secs(args.attempt_timeout_secs))
        .with_probe(probe);

    if let Some(coordinator) = &args.coordinator {
        config = config.with_coordinator(resolve_endpoint(coordinator).await?);
    }
    if let Some(controller) = &args.controller {
        config = config.with_controller(resolve_endpoint(controller).await?);
    }
    if let Some(path) = &args.rendezvous_file {
        config = config.with_rendezvous_file(path.clone());
    }
    if let Some(ip) = args.advertise {
        config = config.with_advertise(ip);
    }
    if let Some(names) = &args.strategies {
        let kinds = names
            .iter()
            .map(|name| name.parse::<StrategyKind>())
            .collect::<Result<Vec<_>, _>>()?;
        config = config.with_strategies(kinds);
    }
    Ok(config)
}

async fn controller(args: ControllerArgs) -> anyhow::Result<ExitCode> {
    let bind = PeerAddress::parse(&args.bind).context("invalid --bind")?;
    let controller = PureController::start(bind, args.world_size).await?;

    let join_timeout = Duration::from_secs(args.join_timeout_secs);
    let disband_timeout = args.disband_timeout_secs.map(Duration::from_secs);
    tokio::select! {
        served = controller.run(join_timeout, disband_timeout) => {
            let roster = served?;
            info!(members = roster.len(), "Controller done");
            Ok(ExitCode::SUCCESS)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Controller interrupted; members still registered will lose the store");
            Ok(ExitCode::from(130))
        }
    }
}

async fn probe(args: ProbeArgs) -> anyhow::Result<ExitCode> {
    let address = resolve_endpoint(&args.address).await?;
    let prober = Prober::new(
        ProbeConfig::default()
            .with_interval(Duration::from_millis(args.interval_ms))
            .with_attempt_timeout(Duration::from_millis(args.timeout_ms))
            .with_max_attempts(args.attempts),
    );

    let result = prober.probe(&address).await?;
    if result.reachable {
        println!(
            "{} reachable after {} attempt(s) in {:.1}ms",
            result.address,
            result.attempts,
            result.duration.as_secs_f64() * 1000.0
        );
        Ok(ExitCode::SUCCESS)
    } else {
        error!(%address, attempts = result.attempts, "Unreachable");
        println!(
            "{} unreachable after {} attempts ({:.1}s)",
            result.address,
            result.attempts,
            result.duration.as_secs_f64()
        );
        Ok(ExitCode::FAILURE)
    }
}

async fn diagnose(args: DiagnoseArgs) -> anyhow::Result<ExitCode> {
    let controller = match &args.controller {
        Some(controller) => Some(resolve_endpoint(controller).await?),
        None => None,
    };
    let prober = Prober::new(ProbeConfig::default().with_max_attempts(3));
    let report = run_diagnostics(&AddressResolver::new(), args.port, controller, &prober).await;
    print!("{report}");
    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
