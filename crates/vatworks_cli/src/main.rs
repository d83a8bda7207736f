//! Vatworks CLI
//!
//! Replays exported vat transcripts against real workers and inspects
//! transcript files.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::bail;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vatworks_core::DeliveryNum;
use vatworks_replay::{ReplayConfig, ReplayCoordinator, ReplaySummary};
use vatworks_storage::{DirBundleHandler, FsSnapshotStore, MemorySnapshotStore, SnapshotStore};
use vatworks_transcript::{TranscriptFileReader, TranscriptLine};
use vatworks_transport::{SubprocessConfig, SubprocessFactory};

#[derive(Parser)]
#[command(name = "vatworks")]
#[command(about = "Vat worker replay tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a transcript through one or more workers in lockstep
    Replay(ReplayArgs),
    /// Count the records in a transcript
    Inspect {
        /// Transcript file (JSON lines)
        transcript: PathBuf,
    },
}

#[derive(Args)]
struct ReplayArgs {
    /// Transcript file (JSON lines)
    transcript: PathBuf,
    /// Worker program speaking the pipe protocol
    #[arg(short, long)]
    worker: PathBuf,
    /// Extra argument for the worker program
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,
    /// JSON file with replay options
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Keep snapshots in this directory instead of memory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Resolve sourceBundleID references from this directory
    #[arg(long)]
    bundle_dir: Option<PathBuf>,
    /// Fail on the first violation, divergence or hash mismatch
    #[arg(long)]
    strict: bool,
    /// Do not start new replicas from snapshots
    #[arg(long)]
    no_reload: bool,
    /// Deliveries between forced snapshots; 0 disables them
    #[arg(long)]
    snapshot_interval: Option<DeliveryNum>,
    /// Keep every snapshot made during the run
    #[arg(long, conflicts_with = "keep_no_snapshots")]
    keep_all_snapshots: bool,
    /// Keep no snapshot made during the run
    #[arg(long)]
    keep_no_snapshots: bool,
    /// Snapshot activity log path
    #[arg(long, conflicts_with = "no_activity_log")]
    activity_log: Option<PathBuf>,
    /// Do not write a snapshot activity log
    #[arg(long)]
    no_activity_log: bool,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl ReplayArgs {
    fn config(&self) -> Result<ReplayConfig> {
        let mut config = match &self.config {
            Some(path) => ReplayConfig::from_file(path)?,
            None => ReplayConfig::default(),
        };
        if self.strict {
            config = config
                .with_strict_divergence(true)
                .with_strict_transcript(true)
                .with_strict_snapshot_hashes(true);
        }
        if self.no_reload {
            config = config.with_forced_reload(false);
        }
        if let Some(interval) = self.snapshot_interval {
            config.forced_snapshot_interval = interval;
        }
        config.keep_all_snapshots |= self.keep_all_snapshots;
        config.keep_no_snapshots |= self.keep_no_snapshots;
        if self.no_activity_log {
            config.snapshot_activity_log = None;
        } else if let Some(path) = &self.activity_log {
            config.snapshot_activity_log = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

async fn cmd_replay(args: ReplayArgs) -> Result<ExitCode> {
    let config = args.config()?;
    let factory = SubprocessFactory::new(
        SubprocessConfig::new(&args.worker).with_args(args.worker_args.iter().cloned()),
    );
    let store: Arc<dyn SnapshotStore> = match &args.snapshot_dir {
        Some(dir) => Arc::new(FsSnapshotStore::new(dir)?),
        None => Arc::new(MemorySnapshotStore::new()),
    };

    let mut coordinator = ReplayCoordinator::new(
        config,
        args.transcript.display().to_string(),
        Arc::new(factory),
        store,
    )?;
    if let Some(dir) = &args.bundle_dir {
        coordinator = coordinator.with_bundles(Arc::new(DirBundleHandler::new(dir)));
    }

    info!(transcript = %args.transcript.display(), worker = %args.worker.display(), "replaying");
    let reader = TranscriptFileReader::open(&args.transcript).await?;
    let summary = coordinator.run(reader).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(summary: &ReplaySummary) {
    println!("Lines read:          {}", summary.lines_read);
    println!("Deliveries replayed: {}", summary.deliveries_replayed);
    println!("Replicas:            {}", summary.replicas.len());
    for stats in &summary.replicas {
        println!(
            "  {} pid {:?} start {:?}: {} deliveries in {:.3}s",
            stats.replica,
            stats.pid,
            stats.start_delivery,
            stats.deliveries_up,
            stats.delivery_time_total.as_secs_f64()
        );
    }
    println!("Violations:          {}", summary.violations.len());
    for v in &summary.violations {
        println!(
            "  {} delivery {}: {:?} at syscall {}",
            v.replica, v.delivery_num, v.kind, v.position
        );
    }
    println!("Divergences:         {}", summary.divergences.len());
    for report in &summary.divergences {
        println!("  {}", report);
    }
    println!("Hash mismatches:     {}", summary.hash_mismatches.len());
    for mismatch in &summary.hash_mismatches {
        let actual: Vec<String> = mismatch.actual.iter().map(ToString::to_string).collect();
        match &mismatch.expected {
            Some(expected) => println!(
                "  after delivery {}: expected {}, got {}",
                mismatch.delivery_num,
                expected,
                actual.join(", ")
            ),
            None => println!(
                "  after delivery {}: replicas produced {}",
                mismatch.delivery_num,
                actual.join(", ")
            ),
        }
    }
}

async fn cmd_inspect(transcript: PathBuf) -> Result<ExitCode> {
    let mut reader = TranscriptFileReader::open(&transcript).await?;
    let mut counts: IndexMap<&'static str, u64> = IndexMap::new();
    let mut first_delivery = None;
    let mut last_delivery = None;
    let mut syscalls = 0usize;

    while let Some((_, line)) = reader.next_line().await? {
        *counts.entry(line.kind()).or_default() += 1;
        if let TranscriptLine::Delivery {
            transcript_num,
            syscalls: recorded,
            ..
        } = &line
        {
            first_delivery.get_or_insert(*transcript_num);
            last_delivery = Some(*transcript_num);
            syscalls += recorded.len();
        }
    }
    if counts.is_empty() {
        bail!("{}: no transcript records", transcript.display());
    }

    println!("Transcript: {}", transcript.display());
    for (kind, count) in &counts {
        println!("  {:<20} {}", kind, count);
    }
    if let (Some(first), Some(last)) = (first_delivery, last_delivery) {
        println!("  deliveries {}..={}, {} syscalls", first, last, syscalls);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vatworks=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Replay(args) => cmd_replay(args).await,
        Commands::Inspect { transcript } => cmd_inspect(transcript).await,
    }
}
