//! CLI command definitions for autograsper.
//!
//! Three commands share one configuration file:
//!
//! - `run`: the full episode loop (controller, monitor, recorder, mirror)
//! - `record`: the Recorder alone, until Ctrl+C
//! - `status`: outcome summary of an existing recorded-data root

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{ExperimentConfig, TaskKind, DEFAULT_CONFIG_PATH};
use crate::controller::{strategy_for, ControllerTimings, TaskController};
use crate::orchestrator::{
    EpisodeOrchestrator, ErrorFlag, OrchestrationContext, OrchestratorTimings, RecorderParts,
    RunReport,
};
use crate::orders::OrderExecutor;
use crate::recorder::{
    FfmpegWriterFactory, MemoryWriterFactory, Recorder, RecorderSettings, VideoWriterFactory,
};
use crate::robot::{HttpRobot, RobotTransport, SimulatedRobot};
use crate::storage::{summarize, RunSummary};
use crate::vision::{ColorLocator, FisheyeUndistorter, NoUndistortion, Undistorter};

/// Default recorded-data root for `status`.
const DEFAULT_ROOT_DIR: &str = "recorded_data";

/// Autonomous data collection for a remote gripper robot.
#[derive(Parser)]
#[command(name = "autograsper")]
#[command(about = "Collect manipulation episodes from a remote gripper robot")]
#[command(version)]
#[command(
    long_about = "autograsper drives a remote gripper robot through repeated task/reset episodes while recording both cameras and the robot state.\n\nEach episode is stored as a numbered session directory with a task and a restore recording and a status.txt outcome.\n\nExample usage:\n  autograsper run --config autograsper/config.yaml --task stack\n  autograsper run --simulate --max-episodes 3\n  autograsper status --root recorded_data"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the episode loop.
    ///
    /// Ctrl+C finishes after the current phase; a second Ctrl+C aborts
    /// immediately.
    Run(RunArgs),

    /// Record both cameras and the robot state until Ctrl+C.
    #[command(alias = "rec")]
    Record(RecordArgs),

    /// Summarize episode outcomes under a recorded-data root.
    Status(StatusArgs),
}

/// Options shared by the commands that talk to a robot.
#[derive(Parser, Debug)]
pub struct RobotArgs {
    /// Experiment configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Use the in-process simulated robot instead of the HTTP API.
    #[arg(long)]
    pub simulate: bool,

    /// Probability that a simulated request fails.
    #[arg(long, default_value = "0.0", requires = "simulate")]
    pub failure_rate: f64,

    /// Robot identifier (overrides `robot.id`).
    #[arg(long)]
    pub robot: Option<String>,

    /// Count frames in memory instead of encoding video.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `autograsper run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub robot: RobotArgs,

    /// Task variant (overrides `experiment.task`).
    #[arg(short, long, value_enum)]
    pub task: Option<TaskKind>,

    /// Stop after this many completed episodes.
    #[arg(short = 'n', long)]
    pub max_episodes: Option<u64>,

    /// Recorded-data root (overrides `recording.root_dir`).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Seed for random block placement.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `autograsper record`.
#[derive(Parser, Debug)]
pub struct RecordArgs {
    #[command(flatten)]
    pub robot: RobotArgs,

    /// Directory to record into.
    #[arg(short, long)]
    pub output_dir: PathBuf,

    /// Frames per video segment (one segment when unset).
    #[arg(short, long)]
    pub segment_length: Option<u64>,
}

/// Arguments for `autograsper status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Recorded-data root to scan.
    #[arg(short, long, default_value = DEFAULT_ROOT_DIR)]
    pub root: PathBuf,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_episodes_command(args).await?,
        Commands::Record(args) => run_record_command(args).await?,
        Commands::Status(args) => run_status_command(args)?,
    }
    Ok(())
}

/// Loads the configuration and applies the shared robot overrides.
///
/// A missing file is only tolerated with `--simulate`.
fn load_config(args: &RobotArgs) -> anyhow::Result<ExperimentConfig> {
    let mut config = if args.simulate && !args.config.exists() {
        warn!(
            path = %args.config.display(),
            "Configuration file not found, using built-in defaults"
        );
        let mut config = ExperimentConfig::default();
        config.apply_env()?;
        config
    } else {
        ExperimentConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    };

    if let Some(robot) = &args.robot {
        config = config.with_robot_id(robot.clone());
    }
    Ok(config)
}

fn build_robot(
    config: &ExperimentConfig,
    args: &RobotArgs,
) -> anyhow::Result<Arc<dyn RobotTransport>> {
    if args.simulate {
        info!(robot = %config.robot.id, failure_rate = args.failure_rate, "Using simulated robot");
        let robot = SimulatedRobot::new(config.robot.id.clone())
            .with_failure_rate(args.failure_rate, 0);
        return Ok(Arc::new(robot));
    }

    let token = config.require_token()?;
    let robot = HttpRobot::new(
        config.robot.id.clone(),
        token,
        &config.robot.api_base,
        Duration::from_secs(config.robot.request_timeout_secs),
        Handle::current(),
    )
    .context("Failed to create robot client")?;
    info!(robot = %config.robot.id, api = %robot.base_api(), "Using robot API");
    Ok(Arc::new(robot))
}

fn build_undistorter(config: &ExperimentConfig, args: &RobotArgs) -> Arc<dyn Undistorter> {
    if args.simulate {
        Arc::new(NoUndistortion)
    } else {
        Arc::new(FisheyeUndistorter::new(
            config.camera.matrix,
            config.camera.distortion,
        ))
    }
}

fn build_writers(config: &ExperimentConfig, args: &RobotArgs) -> Arc<dyn VideoWriterFactory> {
    if args.dry_run {
        Arc::new(MemoryWriterFactory::new())
    } else {
        Arc::new(FfmpegWriterFactory::new(config.recording.ffmpeg.clone()))
    }
}

/// Watches for Ctrl+C: the first press calls `on_first`, the second raises
/// `error`.
fn spawn_interrupt_handler<F>(error: ErrorFlag, on_first: F) -> tokio::task::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, finishing; press Ctrl+C again to abort");
        on_first();
        if tokio::signal::ctrl_c().await.is_ok() {
            error.raise("interrupted by operator");
        }
    })
}

async fn run_episodes_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.robot)?;
    if let Some(task) = args.task {
        config = config.with_task(task);
    }
    if let Some(max) = args.max_episodes {
        config = config.with_max_episodes(max);
    }
    if let Some(root) = &args.output_dir {
        config = config.with_root_dir(root.clone());
    }
    config.validate().context("Invalid configuration")?;

    let robot = build_robot(&config, &args.robot)?;
    let locator = ColorLocator::new(&config.colors, config.camera.pixel_corners)
        .context("Invalid pixel calibration")?;
    let strategy = strategy_for(&config, args.seed).context("Invalid task configuration")?;

    let error = ErrorFlag::new();
    let ctx = OrchestrationContext::with_error_flag(config.timing.poll_interval(), error.clone());
    let executor = Arc::new(
        OrderExecutor::new(Arc::clone(&robot), config.timing.order_settle())
            .with_abort_flag(error.clone()),
    );

    let (phase_tx, phase_rx) = mpsc::channel();
    let controller = Arc::new(
        TaskController::new(executor, Arc::new(locator), strategy, phase_tx)
            .with_timings(ControllerTimings::from_settings(&config.timing))
            .with_start_position(config.experiment.start_position)
            .with_max_episodes(config.experiment.max_episodes),
    );

    let parts = RecorderParts {
        robot: Arc::clone(&robot),
        undistorter: build_undistorter(&config, &args.robot),
        writers: build_writers(&config, &args.robot),
        settings: RecorderSettings::from(&config.recording),
    };
    let orchestrator = EpisodeOrchestrator::new(
        ctx,
        Arc::clone(&controller),
        phase_rx,
        parts,
        config.recording.root_dir.clone(),
    )
    .with_timings(OrchestratorTimings::from_settings(&config.timing));

    info!(
        task = %config.experiment.task,
        robot = %config.robot.id,
        root = %config.recording.root_dir.display(),
        max_episodes = ?config.experiment.max_episodes,
        "Starting run"
    );

    let signal_controller = Arc::clone(&controller);
    let interrupts = spawn_interrupt_handler(error, move || signal_controller.request_finish());
    let result = tokio::task::spawn_blocking(move || orchestrator.run())
        .await
        .context("Orchestrator thread panicked")?;
    interrupts.abort();

    let report = result.context("Run failed")?;
    print_run_report(&report, args.json)?;
    Ok(())
}

fn print_run_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("\n=== Run Report ===");
    println!("Episodes:  {}", report.episodes.len());
    println!("Successes: {}", report.successes());
    println!("Failures:  {}", report.failures());
    for episode in &report.episodes {
        println!("  session {:>4}: {}", episode.session_id, episode.outcome);
    }
    Ok(())
}

async fn run_record_command(args: RecordArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.robot)?;
    if args.segment_length.is_some() {
        config.recording.segment_length = args.segment_length;
    }
    config.validate().context("Invalid configuration")?;

    let robot = build_robot(&config, &args.robot)?;
    let recorder = Arc::new(Recorder::new(
        robot,
        build_undistorter(&config, &args.robot),
        build_writers(&config, &args.robot),
        args.output_dir.clone(),
        RecorderSettings::from(&config.recording),
    ));

    info!(
        output_dir = %args.output_dir.display(),
        segment_length = ?config.recording.segment_length,
        "Recording until Ctrl+C"
    );

    let error = ErrorFlag::new();
    let signal_recorder = Arc::clone(&recorder);
    let interrupts = spawn_interrupt_handler(error.clone(), move || signal_recorder.stop());

    let capture = Arc::clone(&recorder);
    let result = tokio::task::spawn_blocking(move || capture.record(&error))
        .await
        .context("Recorder thread panicked")?;
    interrupts.abort();

    result.context("Recording failed")?;
    println!(
        "Recorded {} frames into {}",
        recorder.frame_counter(),
        args.output_dir.display()
    );
    Ok(())
}

/// JSON shape of `status --json`.
#[derive(Serialize)]
struct StatusOutput<'a> {
    root: &'a Path,
    total: usize,
    success_rate: f64,
    #[serde(flatten)]
    summary: &'a RunSummary,
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let summary = summarize(&args.root)
        .with_context(|| format!("Failed to scan {}", args.root.display()))?;

    if args.json {
        let output = StatusOutput {
            root: &args.root,
            total: summary.total(),
            success_rate: summary.success_rate(),
            summary: &summary,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Recorded Sessions ===");
    println!("Root:         {}", args.root.display());
    println!("Sessions:     {}", summary.total());
    println!("Successes:    {}", summary.successes);
    println!("Failures:     {}", summary.failures);
    println!("Incomplete:   {}", summary.incomplete);
    println!("Success rate: {:.1}%", summary.success_rate());
    println!();
    for session in &summary.sessions {
        let outcome = session.outcome.map_or("incomplete", |o| o.as_str());
        println!("  {:>4}  {}", session.session_id, outcome);
    }
    Ok(())
}
