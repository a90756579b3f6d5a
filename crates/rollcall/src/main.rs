use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Args, Parser, Subcommand};
use rollcall_core::gallery::load_directory;
use rollcall_core::{Clock, FixedClock, OnnxFaceAnalyzer, SystemClock};
use rollcall_hw::{Camera, FrameSource, ImageSequence};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod announce;
mod config;
mod effects;
mod export;
mod pipeline;
mod render;
mod session;

use announce::{CommandAnnouncer, LogAnnouncer};
use config::Config;
use effects::{Announcer, Renderer};
use export::{ExportSink, JsonSink, SqliteSink};
use pipeline::{FramePipeline, PipelineSettings, StopReason};
use render::{BoardRenderer, Renderers, SnapshotRenderer};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    /// Config file (default: $ROLLCALL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take attendance from the camera (or a directory of images) until quit
    Run(RunArgs),
    /// Build the gallery and report what was loaded
    Gallery {
        /// Gallery directory: one folder of images per person
        #[arg(long)]
        gallery: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct RunArgs {
    /// Camera device, e.g. /dev/video0
    #[arg(long)]
    device: Option<String>,
    /// Replay images from this directory instead of the camera
    #[arg(long)]
    replay: Option<PathBuf>,
    #[arg(long)]
    gallery: Option<PathBuf>,
    /// Match threshold (Euclidean distance, exclusive)
    #[arg(long)]
    threshold: Option<f32>,
    /// Late after this time, HH:MM[:SS]
    #[arg(long, value_parser = config::parse_time)]
    cutoff: Option<NaiveTime>,
    /// Downscale factor for detection, 0 < s <= 1
    #[arg(long)]
    scale: Option<f32>,
    /// Pretend the clock reads this time for the whole session
    #[arg(long, value_parser = config::parse_time)]
    at: Option<NaiveTime>,
    /// Skip exporting the final ledger
    #[arg(long)]
    no_export: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => {
            apply_run_args(&mut config, &args);
            config.validate()?;
            run(config, args).await
        }
        Commands::Gallery { gallery } => {
            if let Some(dir) = gallery {
                config.gallery_dir = dir;
            }
            show_gallery(&config)
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
    }
}

fn apply_run_args(config: &mut Config, args: &RunArgs) {
    if let Some(device) = &args.device {
        config.camera_device = device.clone();
    }
    if let Some(dir) = &args.gallery {
        config.gallery_dir = dir.clone();
    }
    if let Some(t) = args.threshold {
        config.match_threshold = t;
    }
    if let Some(cutoff) = args.cutoff {
        config.late_cutoff = cutoff;
    }
    if let Some(scale) = args.scale {
        config.detection_scale = scale;
    }
    if args.replay.is_some() {
        config.warmup_frames = 0;
    }
}

fn load_analyzer(config: &Config) -> Result<OnnxFaceAnalyzer> {
    let scrfd = config.scrfd_model_path();
    let arcface = config.arcface_model_path();
    let analyzer = OnnxFaceAnalyzer::load(&scrfd, &arcface, config.max_faces)
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?
        .with_detection_confidence(config.detection_confidence);
    tracing::info!(scrfd = %scrfd, arcface = %arcface, "face models loaded");
    Ok(analyzer)
}

fn show_gallery(config: &Config) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let gallery = load_directory(&config.gallery_dir, &mut analyzer)
        .with_context(|| format!("failed to load gallery {}", config.gallery_dir.display()))?;

    for identity in gallery.identities() {
        println!("{identity}: {} image(s)", gallery.entries_for(identity.as_str()));
    }
    println!(
        "{} entries, {} identities",
        gallery.len(),
        gallery.identity_count()
    );
    Ok(())
}

async fn run(config: Config, args: RunArgs) -> Result<()> {
    let mut analyzer = load_analyzer(&config)?;
    let gallery = load_directory(&config.gallery_dir, &mut analyzer)
        .with_context(|| format!("failed to load gallery {}", config.gallery_dir.display()))?;
    if gallery.is_empty() {
        tracing::warn!("gallery is empty; every face will be unknown");
    }

    let source: Box<dyn FrameSource + Send> = match &args.replay {
        Some(dir) => Box::new(
            ImageSequence::open(dir)
                .with_context(|| format!("failed to open replay directory {}", dir.display()))?,
        ),
        None => Box::new(
            Camera::open(&config.camera_device, config.camera_width, config.camera_height)
                .with_context(|| format!("failed to open camera {}", config.camera_device))?,
        ),
    };

    let clock: Box<dyn Clock + Send> = match args.at {
        Some(at) => Box::new(FixedClock::new(at)),
        None => Box::new(SystemClock),
    };

    let mut renderers: Vec<Box<dyn Renderer>> = Vec::new();
    if config.show_board {
        renderers.push(Box::new(BoardRenderer::stdout()));
    }
    if let Some(dir) = &config.snapshot_dir {
        let snapshots = SnapshotRenderer::new(dir.clone())
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        renderers.push(Box::new(snapshots));
    }
    let announcer: Box<dyn Announcer> = match &config.announce_command {
        Some(cmd) => Box::new(CommandAnnouncer::parse(cmd)?),
        None => Box::new(LogAnnouncer),
    };
    let (effects, effects_worker) =
        effects::spawn_effects(Renderers(renderers), announcer, config.effects_queue)
            .context("failed to spawn effects thread")?;

    let settings = PipelineSettings {
        threshold: config.match_threshold,
        detection_scale: config.detection_scale,
        warmup_frames: config.warmup_frames,
        max_consecutive_failures: config.max_consecutive_failures,
    };
    tracing::info!(
        threshold = settings.threshold,
        cutoff = %config.late_cutoff,
        identities = gallery.identity_count(),
        "starting session"
    );
    let pipeline = FramePipeline::new(
        Arc::new(gallery),
        config.late_cutoff,
        analyzer,
        clock,
        effects,
        settings,
    );

    let session_date = chrono::Local::now().date_naive();
    let stop = CancellationToken::new();
    let session = session::spawn_session(pipeline, source, stop.clone())?;
    session::watch_quit_key(stop.clone()).context("failed to watch stdin")?;
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; stopping");
                stop.cancel();
            }
        });
    }
    println!("Taking attendance. Type q and Enter to finish.");

    let outcome = session.wait().await?;
    stop.cancel();
    let effects_stats = tokio::task::spawn_blocking(move || effects_worker.finish()).await?;
    tracing::info!(
        announced = effects_stats.announced,
        rendered = effects_stats.rendered,
        failed = effects_stats.failed,
        dropped = outcome.stats.dropped_renders,
        "side effects drained"
    );

    let mut stdout = std::io::stdout();
    render::write_board(&mut stdout, &outcome.snapshot)?;

    let device_lost = matches!(outcome.reason, StopReason::DeviceLost(_));
    if args.no_export {
        tracing::info!("export skipped (--no-export)");
    } else if device_lost && !config.export_partial {
        tracing::warn!("session ended early and export_partial is off; nothing exported");
    } else {
        let rows = outcome.snapshot.export_rows(session_date);
        let mut sinks: Vec<Box<dyn ExportSink>> = Vec::new();
        if let Some(path) = &config.export_db {
            match SqliteSink::open(path) {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot open export database"),
            }
        }
        if let Some(path) = &config.export_json {
            sinks.push(Box::new(JsonSink::new(path.clone())));
        }
        export::export_all(&mut sinks, &rows);
    }

    if let StopReason::DeviceLost(why) = outcome.reason {
        anyhow::bail!("frame source lost: {why}");
    }
    Ok(())
}
