//! Fleet CLI - provisioning against the local simulated backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_provision::hardware;
use fleet_provision::metadata::{image_sources, tools_sources};
use fleet_provision::providers::local::{default_catalog, LocalBackend};
use fleet_provision::{
    Constraint, EnvironConfig, FileStorage, HttpIndexFetcher, InstanceId, Orchestrator,
};

/// Fleet CLI - provision and inspect an environment.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Provision instances for a fleet environment", version)]
struct Cli {
    /// Environment config file (or set `FLEET_CONFIG` env var).
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding environment storage and the local inventory.
    #[arg(long, env = "FLEET_DATA_DIR", default_value = ".fleet")]
    data_dir: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the instance type chosen for a constraint.
    Select {
        /// Constraint (e.g. "arch=amd64 mem=2G").
        #[arg(long, default_value = "")]
        constraint: String,
    },

    /// Classify endpoints by kind and scope.
    Classify {
        /// Host names or IP literals.
        #[arg(required = true)]
        endpoints: Vec<String>,
    },

    /// List image and tools metadata sources.
    Sources,

    /// List image ids matching the environment.
    ValidateImages {
        /// Architecture; any when omitted.
        #[arg(long)]
        arch: Option<String>,
    },

    /// Bootstrap the environment.
    Bootstrap {
        /// Constraint for the control-plane instance.
        #[arg(long, default_value = "")]
        constraint: String,
    },

    /// Start a regular machine.
    Start {
        /// Machine id.
        #[arg(long)]
        machine_id: String,

        /// Provisioning nonce.
        #[arg(long)]
        nonce: String,

        /// Constraint for the instance.
        #[arg(long, default_value = "")]
        constraint: String,
    },

    /// Terminate instances.
    Destroy {
        /// Instance ids.
        ids: Vec<String>,

        /// Terminate every instance of the environment.
        #[arg(long, default_value = "false", conflicts_with = "ids")]
        all: bool,
    },

    /// Show the bootstrap record and control-plane addresses.
    State,

    /// List all instances.
    Instances,

    /// Show the backend status of an instance.
    Status {
        /// Instance id.
        id: String,
    },
}

fn load_config(path: Option<&Path>) -> Result<EnvironConfig> {
    match path {
        Some(path) => EnvironConfig::load(path),
        None => {
            let mut config = EnvironConfig::new("local", "local");
            config.scope_rules = LocalBackend::scope_rules();
            Ok(config)
        }
    }
}

fn catalog(config: &EnvironConfig) -> Vec<hardware::InstanceType> {
    if config.instance_types.is_empty() {
        default_catalog()
    } else {
        config.instance_types.clone()
    }
}

async fn orchestrator(config: EnvironConfig, data_dir: &Path) -> Result<Orchestrator> {
    let data_dir = std::path::absolute(data_dir)
        .with_context(|| format!("Invalid data directory {}", data_dir.display()))?;
    let backend = LocalBackend::open(
        data_dir.join("inventory.yaml"),
        config.region.clone(),
        catalog(&config),
    )
    .await
    .context("Failed to open local inventory")?;
    let storage = FileStorage::new(data_dir.join("storage"));
    let remote = HttpIndexFetcher::new().context("Failed to create metadata fetcher")?;

    Ok(Orchestrator::new(
        config,
        Arc::new(backend),
        Arc::new(storage),
        Arc::new(remote),
    ))
}

fn parse_constraint(text: &str) -> Result<Constraint> {
    text.parse()
        .with_context(|| format!("Invalid constraint {text:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Select { constraint } => {
            let constraint = parse_constraint(&constraint)?;
            let selection = hardware::select(&constraint, &catalog(&config), &config.region)?;
            println!("\nSelected: {}", selection.instance_type.name);
            println!("  Hardware: {}", selection.characteristics);
            println!("  Cost:     {}", selection.instance_type.cost);
        }

        Commands::Classify { endpoints } => {
            println!("\n{:<40} {:<10} {:<14}", "VALUE", "KIND", "SCOPE");
            println!("{}", "-".repeat(66));
            for address in config.scope_rules.classify_all(&endpoints) {
                println!(
                    "{:<40} {:<10} {:<14}",
                    address.value,
                    format!("{:?}", address.kind).to_lowercase(),
                    address.scope.to_string()
                );
            }
        }

        Commands::Sources => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            let config = orchestrator.config();
            println!("\nImage sources:");
            for source in image_sources(config) {
                println!("  [{}] {} ({})", source.priority, source.base_url, source.description);
            }
            println!("Tools sources:");
            for source in tools_sources(config) {
                println!("  [{}] {} ({})", source.priority, source.base_url, source.description);
            }
        }

        Commands::ValidateImages { arch } => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            for id in orchestrator.validate_images(arch.as_deref()).await? {
                println!("{id}");
            }
        }

        Commands::Bootstrap { constraint } => {
            let constraint = parse_constraint(&constraint)?;
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            let state = orchestrator
                .bootstrap(&constraint)
                .await
                .context("Bootstrap failed")?;
            for (id, hardware) in state.members() {
                println!("✅ Bootstrapped {id} ({hardware})");
            }
        }

        Commands::Start {
            machine_id,
            nonce,
            constraint,
        } => {
            let constraint = parse_constraint(&constraint)?;
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            let started = orchestrator
                .start_instance(&machine_id, &nonce, &constraint)
                .await
                .with_context(|| format!("Failed to start machine {machine_id}"))?;
            println!("✅ Started machine {machine_id} as {}", started.instance);
            println!("  Hardware: {}", started.characteristics);
            for address in &started.addresses {
                println!("  Address:  {address}");
            }
        }

        Commands::Destroy { ids, all } => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            let ids: Vec<InstanceId> = if all {
                orchestrator
                    .all_instances()
                    .await?
                    .into_iter()
                    .map(|i| i.id)
                    .collect()
            } else {
                ids.iter().map(|id| InstanceId::new(id.as_str())).collect()
            };
            info!("Destroying {} instance(s)", ids.len());
            orchestrator.destroy(&ids).await?;
            println!("✅ Destroyed {} instance(s)", ids.len());
        }

        Commands::State => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            println!("\nPhase: {}", orchestrator.environment_phase().await?);
            let state = orchestrator.store().load().await?;
            for (id, hardware) in state.members() {
                println!("  {id}: {hardware}");
            }
            for server in orchestrator.state_addresses().await? {
                for address in &server.addresses {
                    println!("  {}: {address}", server.instance);
                }
            }
        }

        Commands::Instances => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            println!("\n{:<16} {:<12} {:<12} {:<25}", "ID", "TYPE", "STATE", "LAUNCHED");
            println!("{}", "-".repeat(68));
            for instance in orchestrator.all_instances().await? {
                println!(
                    "{:<16} {:<12} {:<12} {:<25}",
                    instance.id.as_str(),
                    instance.instance_type,
                    instance.state,
                    instance
                        .launched_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                );
            }
        }

        Commands::Status { id } => {
            let orchestrator = orchestrator(config, &cli.data_dir).await?;
            let status = orchestrator.instance_status(&InstanceId::new(id)).await?;
            println!("{status}");
        }
    }

    Ok(())
}
