//! Colony CLI: run and validate agent cells
//!
//! `colony up` loads the pool, cells, and infra configuration, starts the
//! selected cell, and runs it until interrupted. `colony check` validates
//! configuration without deploying anything.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use colony::agent::AgentTypeRegistry;
use colony::config::{CellConfig, CellsConfig, InfraConfig, PoolConfig};
use colony::orchestrator::{CellState, Orchestrator, dependency_strata};

/// Clean exit.
const EXIT_OK: u8 = 0;
/// Configuration failed to load or validate.
const EXIT_CONFIG: u8 = 1;
/// The cell failed to start.
const EXIT_STARTUP: u8 = 2;
/// The cell degraded at runtime.
const EXIT_DEGRADED: u8 = 3;
/// Interrupted by the operator.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "colony", version, about = "Embedded multi-agent cell orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cell and run it until interrupted
    Up {
        /// Pool file declaring agent types
        #[arg(long)]
        pool: PathBuf,
        /// Cells file declaring agent graphs
        #[arg(long)]
        cells: PathBuf,
        /// Optional infrastructure file
        #[arg(long)]
        infra: Option<PathBuf>,
        /// Cell id to run; defaults to the first declared cell
        #[arg(long)]
        cell: Option<String>,
    },
    /// Validate configuration without deploying
    Check {
        #[arg(long)]
        pool: PathBuf,
        #[arg(long)]
        cells: PathBuf,
        #[arg(long)]
        infra: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Up {
            pool,
            cells,
            infra,
            cell,
        } => up(&pool, &cells, infra.as_deref(), cell.as_deref()).await,
        Command::Check { pool, cells, infra } => {
            match check(&pool, &cells, infra.as_deref()) {
                Ok(()) => {
                    println!("configuration ok");
                    EXIT_OK
                }
                Err(config_error) => {
                    eprintln!("configuration error: {config_error:#}");
                    EXIT_CONFIG
                }
            }
        }
    };
    ExitCode::from(code)
}

fn init_tracing(infra: &InfraConfig) {
    let default_directive = if infra.debug {
        "colony=debug".to_owned()
    } else {
        format!("colony={}", infra.log_level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_infra(path: Option<&Path>) -> Result<InfraConfig> {
    match path {
        Some(path) => InfraConfig::from_path(path)
            .with_context(|| format!("loading infra config from {}", path.display())),
        None => Ok(InfraConfig::default()),
    }
}

/// Loads and validates the pool and the selected cell
fn load_cell(
    pool_path: &Path,
    cells_path: &Path,
    cell_id: Option<&str>,
) -> Result<(PoolConfig, CellConfig)> {
    let pool = PoolConfig::from_path(pool_path)
        .with_context(|| format!("loading pool from {}", pool_path.display()))?;
    let cells = CellsConfig::from_path(cells_path, &pool)
        .with_context(|| format!("loading cells from {}", cells_path.display()))?;
    let cell = cells.select(cell_id).context("selecting cell")?.clone();
    Ok((pool, cell))
}

async fn up(
    pool_path: &Path,
    cells_path: &Path,
    infra_path: Option<&Path>,
    cell_id: Option<&str>,
) -> u8 {
    let infra = match load_infra(infra_path) {
        Ok(infra) => infra,
        Err(config_error) => {
            eprintln!("configuration error: {config_error:#}");
            return EXIT_CONFIG;
        }
    };
    init_tracing(&infra);

    let (pool, cell) = match load_cell(pool_path, cells_path, cell_id) {
        Ok(loaded) => loaded,
        Err(config_error) => {
            error!("configuration error: {config_error:#}");
            return EXIT_CONFIG;
        }
    };

    // Embedded agent implementations register their constructors here
    // before the deployer resolves `call`-operated types.
    let registry = Arc::new(AgentTypeRegistry::new());

    let mut orchestrator = match Orchestrator::new(pool, cell, infra, registry) {
        Ok(orchestrator) => orchestrator,
        Err(config_error) => {
            error!(%config_error, "configuration error");
            return EXIT_CONFIG;
        }
    };

    if let Err(startup_error) = orchestrator.start().await {
        error!(%startup_error, "cell failed to start");
        return EXIT_STARTUP;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping cell");
            signal.cancel();
        }
    });

    let final_state = orchestrator.run(shutdown.clone()).await;
    orchestrator.shutdown().await;

    match final_state {
        Ok(CellState::Degraded) => EXIT_DEGRADED,
        Ok(_) if shutdown.is_cancelled() => EXIT_INTERRUPTED,
        Ok(_) => EXIT_OK,
        Err(run_error) => {
            error!(%run_error, "cell run failed");
            EXIT_STARTUP
        }
    }
}

fn check(pool_path: &Path, cells_path: &Path, infra_path: Option<&Path>) -> Result<()> {
    let infra = load_infra(infra_path)?;
    let pool = PoolConfig::from_path(pool_path)
        .with_context(|| format!("loading pool from {}", pool_path.display()))?;
    let cells = CellsConfig::from_path(cells_path, &pool)
        .with_context(|| format!("loading cells from {}", cells_path.display()))?;
    for cell in &cells.cells {
        let strata = dependency_strata(cell)
            .with_context(|| format!("resolving dependencies for cell {}", cell.id))?;
        println!(
            "cell {}: {} agents in {} strata",
            cell.id,
            cell.agents.len(),
            strata.len()
        );
    }
    println!(
        "pool: {} agent types; data root: {}",
        pool.agent_types.len(),
        infra.data_root.display()
    );
    Ok(())
}
