use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cutover_core::platform::{PowerState, SimulatedPlatform};
use cutover_core::types::{DiskBus, DiskUpdate, GuestFamily, SourceSpec};
use cutover_core::{
    ConfigOverrides, ContextId, ContextStatus, CutoverConfig, CutoverService, FailoverKind,
    FailoverRequest, JobId, RollbackOptions,
};

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "VM failover orchestration for replicated workloads", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a failover and rollback against the simulated platform
    Demo {
        #[arg(long, default_value = "test")]
        kind: FailoverKind,

        /// Number of replicated disks
        #[arg(long, default_value = "2")]
        disks: u32,

        /// Model a Windows source on a SCSI bus, which needs driver preparation
        #[arg(long)]
        windows: bool,

        /// Leave the failed-over VM in place
        #[arg(long)]
        keep: bool,
    },
    /// Show a job's status
    Status {
        #[arg(long)]
        job: JobId,
    },
    /// List contexts and their status
    Contexts,
    /// Show network mapping options for a context
    Networks {
        #[arg(long)]
        context: String,
        #[arg(long, default_value = "live")]
        kind: FailoverKind,
    },
    /// Map a source network to a destination network
    MapNetwork {
        #[arg(long)]
        context: String,
        #[arg(long)]
        kind: FailoverKind,
        #[arg(long)]
        source: String,
        #[arg(long)]
        destination: String,
    },
    /// Settle jobs and volume operations left behind by a previous process
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CutoverConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.json {
        config.logging.json = true;
    }
    init_logging(&config)?;

    match &cli.command {
        // The simulated platform lives only as long as this process
        Commands::Demo { .. } => {
            config.platform.backend = "simulated".to_string();
            config.reconcile.run_on_startup = false;
        }
        Commands::Reconcile => config.reconcile.run_on_startup = false,
        _ => {}
    }
    let service = CutoverService::open(config).await?;
    if let Some(platform) = &service.simulator {
        seed_networks(platform);
    }

    match cli.command {
        Commands::Demo {
            kind,
            disks,
            windows,
            keep,
        } => {
            run_demo(&service, kind, disks, windows, keep).await?;
        }
        Commands::Status { job } => {
            let status = service.orchestrator.get_job_status(job).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Contexts => {
            for context in service.contexts.list_contexts().await? {
                let last_job = context
                    .last_job_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<20} {:<22} {}",
                    context.context_id.to_string(),
                    context.name,
                    context.status.to_string(),
                    last_job
                );
            }
        }
        Commands::Networks { context, kind } => {
            let options = service
                .orchestrator
                .get_network_config_options(&ContextId::new(context), kind)
                .await?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Commands::MapNetwork {
            context,
            kind,
            source,
            destination,
        } => {
            let mapping = service
                .networks
                .set_mapping(&ContextId::new(context), kind, &source, &destination)
                .await?;
            println!("{}", serde_json::to_string_pretty(&mapping)?);
        }
        Commands::Reconcile => {
            let summary = service.reconciler.run().await?;
            println!(
                "operations: {} completed, {} failed; jobs: {} completed, {} failed, {} not yet stale, {} running",
                summary.operations.completed,
                summary.operations.failed,
                summary.jobs_completed,
                summary.jobs_failed,
                summary.jobs_left_fresh,
                summary.jobs_left_running
            );
        }
    }

    Ok(())
}

fn init_logging(config: &CutoverConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("cutover={level},cutover_core={level}"))
            .with_context(|| format!("invalid log level '{}'", level))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

const DEMO_CONTEXT: &str = "demo-web01";
const DEMO_SOURCE_VM: &str = "vm-demo-101";
const DEMO_SOURCE_NETWORK: &str = "VM Network";
const DEMO_PROD_NETWORK: &str = "net-prod";
const DEMO_ISOLATED_NETWORK: &str = "net-iso";

async fn run_demo(
    service: &CutoverService,
    kind: FailoverKind,
    disks: u32,
    windows: bool,
    keep: bool,
) -> Result<()> {
    let platform = service
        .simulator
        .clone()
        .context("demo requires the simulated platform")?;
    let context_id = seed_demo(service, &platform, disks, windows).await?;

    let job = service
        .orchestrator
        .execute_failover(
            FailoverRequest::new(context_id.clone(), kind),
            ConfigOverrides::default(),
        )
        .await?;
    let status = service.orchestrator.get_job_status(job.job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if keep {
        return Ok(());
    }

    let rollback = service
        .orchestrator
        .execute_rollback(&context_id, kind, RollbackOptions::for_kind(kind))
        .await?;
    let status = service.orchestrator.get_job_status(rollback.job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Destination networks the simulated backend offers
fn seed_networks(platform: &SimulatedPlatform) {
    platform.add_network(DEMO_PROD_NETWORK, "production", false);
    platform.add_network(DEMO_ISOLATED_NETWORK, "isolated-test", true);
}

/// Source VM and one replicated appliance volume per disk
async fn seed_demo(
    service: &CutoverService,
    platform: &Arc<SimulatedPlatform>,
    disks: u32,
    windows: bool,
) -> Result<ContextId> {
    let context_id = ContextId::new(DEMO_CONTEXT);
    if service.contexts.get_context(&context_id).await?.is_some() {
        service.contexts.decommission_context(&context_id).await?;
    }

    platform.add_source_vm(DEMO_SOURCE_VM, PowerState::Running);

    let (guest_family, disk_bus) = if windows {
        (GuestFamily::Windows, DiskBus::Scsi)
    } else {
        (GuestFamily::Linux, DiskBus::Virtio)
    };
    let spec = SourceSpec {
        guest_family,
        disk_bus,
        networks: vec![DEMO_SOURCE_NETWORK.to_string()],
        ..SourceSpec::default()
    };
    service
        .contexts
        .register_context(context_id.clone(), DEMO_SOURCE_VM, "web01", spec)
        .await?;

    for n in 0..disks.max(1) {
        let disk_key = 2000 + n;
        let volume_id = platform.seed_appliance_volume(&format!("web01-{}", disk_key), 20);
        service
            .contexts
            .upsert_disk(
                &context_id,
                DiskUpdate {
                    disk_key,
                    size_gb: 20,
                    change_marker: Some(format!("52 3c 4f-{}", disk_key)),
                    volume_id: Some(volume_id),
                },
            )
            .await?;
    }

    service
        .networks
        .set_mapping(&context_id, FailoverKind::Live, DEMO_SOURCE_NETWORK, DEMO_PROD_NETWORK)
        .await?;
    service
        .networks
        .set_mapping(&context_id, FailoverKind::Test, DEMO_SOURCE_NETWORK, DEMO_ISOLATED_NETWORK)
        .await?;
    service
        .contexts
        .set_status(&context_id, ContextStatus::ReadyForFailover)
        .await?;
    Ok(context_id)
}
