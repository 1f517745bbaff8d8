mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use events::{Event, EventBus};
use ledger::{RunRecordRepository, SampleLedger, SqliteLedger};
use orchestrator::config::join_instrument_path;
use orchestrator::dispatcher::job_command;
use orchestrator::{Dispatcher, PlanCompiler, RunScheduler, Spacing};
use pal_core::{Job, MicroStep, Sample};
use registry::PositionRegistry;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{InstrumentTransport, LocalTransport, SshTransport};

use crate::config::{PalConfig, TransportKind};

const PAL_DIR: &str = ".pal";
const CONFIG_FILE: &str = "config.toml";
const RECENT_RUNS: i64 = 10;

#[derive(Parser)]
#[command(name = "palctl")]
#[command(about = "Plans and runs PAL autosampler jobs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file, defaults to .pal/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the ledger database
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Inspect or clear position occupancy
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Compile and submit a job file (JSON list of micro-steps)
    Run {
        job: PathBuf,

        /// Compile and print the instrument command without submitting
        #[arg(long)]
        dry_run: bool,
    },
    /// Submit a job file repeatedly
    Schedule {
        job: PathBuf,

        #[arg(long)]
        runs: usize,

        #[arg(long, value_enum, default_value_t = SpacingKind::Linear)]
        spacing: SpacingKind,

        /// Seconds between runs (linear, comma separated) or base period (geometric)
        #[arg(long, value_delimiter = ',')]
        period: Vec<f64>,

        #[arg(long, default_value_t = 1.0)]
        factor: f64,

        /// Seconds from schedule start for each run (custom)
        #[arg(long, value_delimiter = ',')]
        offsets: Vec<f64>,

        /// Seconds subtracted from every wait
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
    },
    Status,
}

#[derive(Subcommand)]
enum RegistryAction {
    Show,
    /// Empty every custom position and tray
    Reset,
    UnloadCustom { name: String },
    UnloadTray { tray: u32, slot: u32 },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpacingKind {
    Linear,
    Geometric,
    Custom,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => std::env::current_dir()?.join(PAL_DIR).join(CONFIG_FILE),
    };

    match cli.command {
        Commands::Init { force } => init_project(&config_path, force).await,
        Commands::Registry { action } => {
            let config = PalConfig::load(&config_path).await?;
            registry_command(&config, action).await
        }
        Commands::Run { job, dry_run } => {
            let config = PalConfig::load(&config_path).await?;
            let steps = load_steps(&job).await?;
            if dry_run {
                preview_job(&config, &steps).await
            } else {
                run_job(&config, &steps).await
            }
        }
        Commands::Schedule {
            job,
            runs,
            spacing,
            period,
            factor,
            offsets,
            offset,
        } => {
            let config = PalConfig::load(&config_path).await?;
            let steps = load_steps(&job).await?;
            let spacing = build_spacing(spacing, &period, factor, &offsets)?;
            let offset = seconds(offset).context("Invalid --offset")?;
            schedule_job(&config, &steps, runs, &spacing, offset).await
        }
        Commands::Status => status(&config_path).await,
    }
}

async fn init_project(config_path: &Path, force: bool) -> Result<()> {
    if let Some(dir) = config_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let config = if config_path.exists() && !force {
        println!("Config already exists at {}, keeping it.", config_path.display());
        PalConfig::load(config_path).await?
    } else {
        let config = PalConfig::default();
        let content = toml::to_string_pretty(&config)?;
        tokio::fs::write(config_path, content).await?;
        println!("Wrote {}", config_path.display());
        config
    };

    let pool = ledger::create_pool(&config.ledger.database_url)
        .await
        .context("Failed to open ledger database")?;
    ledger::run_migrations(&pool)
        .await
        .context("Failed to run ledger migrations")?;

    let registry = PositionRegistry::load(&config.registry.snapshot_path, config.topology()).await?;
    registry.save().await?;

    println!();
    println!("Ledger:    {}", config.ledger.database_url);
    println!("Registry:  {}", config.registry.snapshot_path.display());
    println!(
        "Topology:  {} custom positions, {} trays",
        config.topology.customs.len(),
        config.topology.trays.len()
    );
    println!();
    println!("Edit the config to match the instrument, then run 'palctl registry show'.");

    Ok(())
}

async fn registry_command(config: &PalConfig, action: RegistryAction) -> Result<()> {
    let registry = PositionRegistry::load(&config.registry.snapshot_path, config.topology()).await?;

    match action {
        RegistryAction::Show => show_registry(&registry).await,
        RegistryAction::Reset => {
            registry.reset().await?;
            println!("Registry reset.");
        }
        RegistryAction::UnloadCustom { name } => match registry.unload_custom(&name).await? {
            Some(sample) => println!("Unloaded {} from {}", sample.describe(), name),
            None => println!("{} was already empty", name),
        },
        RegistryAction::UnloadTray { tray, slot } => {
            let removed = registry.unload_tray(tray, slot).await?;
            println!("Unloaded {} vials from tray {} slot {}", removed.len(), tray, slot);
        }
    }

    Ok(())
}

async fn show_registry(registry: &PositionRegistry) {
    let snapshot = registry.snapshot().await;

    println!();
    println!("Custom positions:");
    for (name, state) in &snapshot.customs {
        let mut flags = Vec::new();
        if state.capabilities.assembly_allowed {
            flags.push("assembly");
        }
        if !state.capabilities.destination_allowed {
            flags.push("source-only");
        }
        if state.capabilities.always_destroys {
            flags.push("destroys");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        };
        println!("  {:<16} {}{}", name, occupant_line(state.sample.as_ref()), flags);
    }

    println!();
    println!("Trays:");
    for (tray, slots) in &snapshot.trays {
        for (slot, state) in slots {
            let occupied = state.vials.iter().filter(|v| v.is_some()).count();
            println!(
                "  tray {} slot {} {} ({}/{} occupied)",
                tray,
                slot,
                state.kind.as_str(),
                occupied,
                state.vials.len()
            );
            for (index, vial) in state.vials.iter().enumerate() {
                let blocked = state.blocked.get(index).copied().unwrap_or(false);
                if vial.is_some() || blocked {
                    let marker = if blocked { " [reserved]" } else { "" };
                    println!("    vial {:<3} {}{}", index + 1, occupant_line(vial.as_ref()), marker);
                }
            }
        }
    }
    println!();
}

fn occupant_line(sample: Option<&Sample>) -> String {
    match sample {
        None => "empty".to_string(),
        Some(sample) => match sample.volume_ml() {
            Some(volume) => format!("{} {:.3} mL", sample.describe(), volume),
            None => sample.describe(),
        },
    }
}

async fn load_steps(path: &Path) -> Result<Vec<MicroStep>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let steps: Vec<MicroStep> =
        serde_json::from_str(&content).with_context(|| format!("Invalid job file {}", path.display()))?;
    if steps.is_empty() {
        bail!("Job file {} has no steps", path.display());
    }
    Ok(steps)
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow::anyhow!("{} s: {}", value, e))
}

fn build_spacing(kind: SpacingKind, period: &[f64], factor: f64, offsets: &[f64]) -> Result<Spacing> {
    let spacing = match kind {
        SpacingKind::Linear => Spacing::Linear {
            periods: period.iter().map(|p| seconds(*p)).collect::<Result<_>>()?,
        },
        SpacingKind::Geometric => {
            let [period] = period else {
                bail!("--spacing geometric takes exactly one --period");
            };
            Spacing::Geometric {
                period: seconds(*period)?,
                factor,
            }
        }
        SpacingKind::Custom => Spacing::Custom {
            offsets: offsets.iter().map(|o| seconds(*o)).collect::<Result<_>>()?,
        },
    };
    Ok(spacing)
}

/// Everything a submission needs, opened from the config.
struct Station {
    compiler: PlanCompiler,
    dispatcher: Arc<Dispatcher>,
    event_bus: EventBus,
}

async fn open_station(config: &PalConfig) -> Result<Station> {
    let event_bus = EventBus::new();

    let registry = PositionRegistry::load(&config.registry.snapshot_path, config.topology())
        .await?
        .with_event_bus(event_bus.clone());

    let pool = ledger::create_pool(&config.ledger.database_url)
        .await
        .context("Failed to open ledger database")?;
    ledger::run_migrations(&pool).await?;
    let sample_ledger: Arc<dyn SampleLedger> =
        Arc::new(SqliteLedger::new(pool.clone(), config.ledger.machine_name.clone()));

    let transport: Arc<dyn InstrumentTransport> = match config.transport.kind {
        TransportKind::Local => Arc::new(LocalTransport::new(config.local_transport())),
        TransportKind::Remote => Arc::new(SshTransport::new(config.remote_transport()?)),
    };

    let dispatcher = Dispatcher::new(
        registry.clone(),
        sample_ledger,
        transport,
        config.dispatcher_config(),
    )
    .with_run_records(RunRecordRepository::new(pool))
    .with_event_bus(event_bus.clone());

    if config.triggers.enabled {
        info!("No trigger lines are wired, runs will be stamped with the local clock");
    }

    Ok(Station {
        compiler: PlanCompiler::new(registry),
        dispatcher: Arc::new(dispatcher),
        event_bus,
    })
}

fn abort_on_ctrl_c(dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting");
            dispatcher.abort();
        }
    });
}

fn print_progress(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => match envelope.event {
                    Event::JobSubmitted { job_id, run_count, transport } => {
                        println!("Submitted job {} ({} runs) via {}", job_id, run_count, transport);
                    }
                    Event::StepRunConfirmed { method, samples_out, .. } => {
                        println!("  {} confirmed -> {}", method, samples_out.join(", "));
                    }
                    Event::StepRunFailed { kind, message, .. } => {
                        println!("  run failed [{}]: {}", kind, message);
                    }
                    Event::ScheduledRunStarted { run_index, total_runs, .. } => {
                        println!("Run {}/{}", run_index + 1, total_runs);
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_job(job: &Job) {
    println!();
    println!("Job {}", job.id);
    if let Some(log) = &job.aux_log_path {
        println!("Aux log: {}", log);
    }
    for run in &job.runs {
        let endpoint = |snapshot: &Option<pal_core::PositionSnapshot>| match snapshot {
            Some(s) => match s.position.coord() {
                Some(coord) => coord.to_string(),
                None => s.position.name().to_string(),
            },
            None => "-".to_string(),
        };
        let out: Vec<String> = run.samples_out.iter().map(|s| s.describe()).collect();
        println!(
            "  #{} {:<13} {} uL  {} -> {}  [{}]  {}",
            run.step_index,
            run.method.name(),
            run.volume_ul,
            endpoint(&run.source),
            endpoint(&run.destination),
            if run.is_confirmed() { "done" } else { "pending" },
            out.join(", ")
        );
    }
    println!();
}

async fn preview_job(config: &PalConfig, steps: &[MicroStep]) -> Result<()> {
    let registry = PositionRegistry::load(&config.registry.snapshot_path, config.topology()).await?;
    let compiler = PlanCompiler::new(registry.clone());
    let job = compiler.compile(steps).await?;

    let logfile = join_instrument_path(&config.transport.log_dir, "dry-run.txt");
    let command = job_command(&job, &config.transport.method_dir, &logfile);

    print_job(&job);
    println!("{}", command.command_line(&config.transport.pal_executable));

    for run in &job.runs {
        let Some(destination) = &run.destination else {
            continue;
        };
        if let (Some(coord), None) = (destination.position.coord(), &destination.before) {
            registry.release_vial(coord).await?;
        }
    }
    Ok(())
}

async fn run_job(config: &PalConfig, steps: &[MicroStep]) -> Result<()> {
    let station = open_station(config).await?;
    abort_on_ctrl_c(station.dispatcher.clone());
    print_progress(&station.event_bus);

    let mut job = station.compiler.compile(steps).await?;
    let result = station.dispatcher.submit(&mut job).await;
    print_job(&job);

    if let Err(e) = result {
        bail!("Job {} failed [{}]: {}", job.id, e.kind(), e);
    }
    println!("Job {} complete.", job.id);
    Ok(())
}

async fn schedule_job(
    config: &PalConfig,
    steps: &[MicroStep],
    runs: usize,
    spacing: &Spacing,
    offset: Duration,
) -> Result<()> {
    let station = open_station(config).await?;
    abort_on_ctrl_c(station.dispatcher.clone());
    print_progress(&station.event_bus);

    let scheduler = RunScheduler::new(station.compiler, station.dispatcher.clone())
        .with_event_bus(station.event_bus.clone());

    match scheduler.run_schedule(steps, runs, spacing, offset).await {
        Ok(completed) => {
            for run in &completed {
                println!(
                    "Run {} at +{:.1} s: job {}",
                    run.index + 1,
                    run.offset_from_start.as_secs_f64(),
                    run.job.id
                );
            }
            println!("Schedule complete.");
            Ok(())
        }
        Err(e) => bail!("Schedule stopped [{}]: {}", e.kind(), e),
    }
}

async fn status(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        println!("No config at {}.", config_path.display());
        println!("Run 'palctl init' to create one.");
        return Ok(());
    }
    let config = PalConfig::load(config_path).await?;

    let registry = PositionRegistry::load(&config.registry.snapshot_path, config.topology()).await?;
    let snapshot = registry.snapshot().await;
    let customs = snapshot.customs.values().filter(|c| c.sample.is_some()).count();
    let vials = snapshot.vials().filter(|(_, state, index)| state.vials[*index].is_some()).count();

    println!();
    println!("Config:    {}", config_path.display());
    println!(
        "Transport: {}",
        match config.transport.kind {
            TransportKind::Local => format!("local ({})", config.transport.pal_executable),
            TransportKind::Remote => format!(
                "remote ({}@{})",
                config.transport.user.as_deref().unwrap_or("?"),
                config.transport.host.as_deref().unwrap_or("?")
            ),
        }
    );
    println!("Registry:  {} customs and {} vials occupied", customs, vials);

    let pool = ledger::create_pool(&config.ledger.database_url)
        .await
        .context("Failed to open ledger database")?;
    ledger::run_migrations(&pool).await?;
    let records = RunRecordRepository::new(pool).find_recent(RECENT_RUNS).await?;

    println!();
    if records.is_empty() {
        println!("No runs recorded yet.");
    } else {
        println!("Recent runs:");
        for record in &records {
            println!(
                "  {} {:<13} {} -> {}  {}",
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.method,
                record.source_position.as_deref().unwrap_or("-"),
                record.destination_position.as_deref().unwrap_or("-"),
                record.samples_out.join(", ")
            );
        }
    }
    println!();

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}
