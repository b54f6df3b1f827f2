//! remlab daemon: broker, lab-server, and equipment tiers in one process.

use clap::{Parser, Subcommand};
use remlab::authority::{LabServerAuthority, MemoryStore, RuntimeSumEstimator};
use remlab::broker::{BrokerGateway, ConfigCouponRegistry, InProcessLabClient, LabClient, LogNotifier};
use remlab::config::{RigSettings, Settings};
use remlab::equipment::{EquipmentEngine, MachineRig, RadioactivityRig, RigDriver};
use remlab::proto::ExperimentSpecification;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "remlab", about = "Federated remote-laboratory service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Validate an experiment specification document against the configured
    /// rig, then exit.
    Validate {
        /// Path to the specification XML file.
        spec: PathBuf,
        /// Print the full validation report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the full broker/lab-server/equipment stack.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.application.log_level.clone())),
        )
        .init();

    match cli.command {
        Command::CheckConfig => {
            info!(name = %settings.application.name, "configuration is valid");
            Ok(())
        }
        Command::Validate { spec, json } => {
            let document = std::fs::read_to_string(&spec)?;
            let parsed = ExperimentSpecification::parse(&document)?;
            let engine = settings.lab_server.rig.validation_engine();
            let report = engine.validate(&parsed);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.accepted {
                    std::process::exit(1);
                }
                return Ok(());
            }
            if report.accepted {
                println!(
                    "Accepted: estimated runtime {:.0} s",
                    report.estimated_runtime
                );
                for warning in &report.warning_messages {
                    println!("Warning: {warning}");
                }
                Ok(())
            } else {
                println!(
                    "Rejected: {}",
                    report.error_message.as_deref().unwrap_or("unspecified")
                );
                std::process::exit(1);
            }
        }
        Command::Run => run(settings).await,
    }
}

/// Assemble and run the three tiers in-process.
async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(name = %settings.application.name, "starting remlab");

    let driver: Arc<dyn RigDriver> = match &settings.lab_server.rig {
        RigSettings::Machine(_) => Arc::new(MachineRig::default()),
        RigSettings::Radioactivity(_) => Arc::new(RadioactivityRig::default()),
    };
    let equipment = Arc::new(EquipmentEngine::new(
        driver,
        settings.lab_server.rig.validation_engine(),
        settings.equipment.clone(),
    ));

    let authority = Arc::new(LabServerAuthority::new(
        settings.lab_server.clone(),
        Arc::new(MemoryStore::new()),
        equipment,
        Arc::new(RuntimeSumEstimator),
    ));
    let completions = authority.subscribe_completions();

    let mut clients: HashMap<String, Arc<dyn LabClient>> = HashMap::new();
    clients.insert(
        settings.lab_server.guid.clone(),
        Arc::new(InProcessLabClient::new(Arc::clone(&authority))),
    );
    let coupons = Arc::new(ConfigCouponRegistry::new(&settings.broker.coupons));
    let gateway = BrokerGateway::new(
        settings.broker.clone(),
        coupons,
        clients,
        Arc::new(LogNotifier),
    )?;
    gateway.watch_completions(completions);

    info!(
        lab_server = %settings.lab_server.guid,
        "remlab stack assembled; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
