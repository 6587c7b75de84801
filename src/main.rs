// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sonar_assist::calibration::{CalibrationStore, DepthCalibrator, YamlCalibrationStore};
use sonar_assist::frame_source::open_source;
use sonar_assist::pipeline::{PipelineOrchestrator, RunMode};
use sonar_assist::remote_classifier::{DisabledClassifier, RemoteClassifier, VisionContext};
use sonar_assist::report::{AnalysisReport, FrameReport};
use sonar_assist::sinks::{speech_from_argv, AnnotatedFrameWriter};
use sonar_assist::types::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sonar-assist")]
#[command(about = "Fishfinder mark detection with spoken fishing cues", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML config file; also holds the depth calibration
    #[arg(long, short, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a recording as fast as possible and write a JSON report
    Analyze {
        /// Image file, directory of frames, or video file
        input: PathBuf,

        /// Frame rate of the recording
        #[arg(long)]
        fps: Option<f64>,

        /// Voice cues while analysing
        #[arg(long)]
        speak: bool,

        /// Skip the remote vision classifier
        #[arg(long)]
        no_classifier: bool,
    },

    /// Real-time loop with voice cues; Ctrl-C stops
    Watch {
        input: PathBuf,

        /// Processing rate (defaults to capture.target_fps)
        #[arg(long)]
        fps: Option<f64>,
    },

    /// Set the depth scale from two reference ticks and save it
    Calibrate {
        #[arg(long)]
        top_pixel: f64,
        #[arg(long)]
        top_depth: f64,
        #[arg(long)]
        bottom_pixel: f64,
        #[arg(long)]
        bottom_depth: f64,
    },

    /// Print the depth for a pixel row
    Depth { pixel: f64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_found = cli.config.exists();
    let config = Config::load_or_default(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config_found {
        warn!("Config {} not found, using defaults", cli.config.display());
    }

    match cli.command {
        Commands::Analyze {
            input,
            fps,
            speak,
            no_classifier,
        } => analyze(config, &input, fps, speak, no_classifier).await,
        Commands::Watch { input, fps } => watch(config, &input, fps).await,
        Commands::Calibrate {
            top_pixel,
            top_depth,
            bottom_pixel,
            bottom_depth,
        } => calibrate(&cli.config, (top_pixel, top_depth), (bottom_pixel, bottom_depth)),
        Commands::Depth { pixel } => {
            let calibrator = DepthCalibrator::new(config.depth_map);
            println!("{:.1} ft", calibrator.pixel_to_depth(pixel));
            Ok(())
        }
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn analyze(
    config: Config,
    input: &Path,
    fps: Option<f64>,
    speak: bool,
    no_classifier: bool,
) -> Result<()> {
    info!("🐟 Sonar assist: batch analysis");

    let fps = fps.unwrap_or(config.capture.target_fps);
    let source = open_source(input, fps)?;
    let report_fps = source.nominal_fps();

    let mut orchestrator = build_orchestrator(&config, !no_classifier)?;
    if speak {
        orchestrator =
            orchestrator.with_speech(speech_from_argv(config.speech.command.as_deref()));
    }

    let mut frames = Vec::new();
    orchestrator
        .run(source, RunMode::Batch, |ctx| {
            frames.push(FrameReport::from_context(&ctx, report_fps));
        })
        .await?;

    let report = AnalysisReport::new(input.display().to_string(), report_fps, frames);
    report.log_summary();

    if config.output.write_report {
        let path = Path::new(&config.output.dir).join(report_file_name(input));
        report.write_json(&path)?;
    }
    Ok(())
}

async fn watch(config: Config, input: &Path, fps: Option<f64>) -> Result<()> {
    info!("🐟 Sonar assist: watching (Ctrl-C to stop)");

    let fps = fps.unwrap_or(config.capture.target_fps);
    let source = open_source(input, fps)?;

    let mut orchestrator = build_orchestrator(&config, true)?
        .with_speech(speech_from_argv(config.speech.command.as_deref()));
    orchestrator.set_nominal_fps(Some(fps));

    orchestrator
        .run(source, RunMode::Paced { fps }, |ctx| {
            if let Some(rec) = &ctx.recommendation {
                info!(
                    "Frame {}: {}{}",
                    ctx.frame_index,
                    rec.text,
                    if ctx.spoken { "" } else { " (suppressed)" }
                );
            }
        })
        .await
}

fn calibrate(config_path: &Path, top: (f64, f64), bottom: (f64, f64)) -> Result<()> {
    let store = YamlCalibrationStore::new(config_path);
    let mut calibrator = DepthCalibrator::from_store(&store);
    calibrator
        .calibrate_and_save(top, bottom, &store)
        .context("Failed to save calibration")?;

    let saved = store
        .load()?
        .context("Calibration missing after save")?;
    let (lo, hi) = DepthCalibrator::new(saved).depth_range();
    println!(
        "Calibrated: {:.0}px = {:.1}ft, {:.0}px = {:.1}ft (range {:.1}-{:.1} ft)",
        top.0, top.1, bottom.0, bottom.1, lo, hi
    );
    Ok(())
}

// ============================================================================
// WIRING
// ============================================================================

fn build_orchestrator(config: &Config, want_classifier: bool) -> Result<PipelineOrchestrator> {
    let classifier: Arc<dyn RemoteClassifier> =
        if want_classifier && config.classifier.use_classifier {
            match VisionContext::from_config(&config.classifier) {
                Ok(ctx) => Arc::new(ctx),
                Err(e) => {
                    warn!("Vision classifier unavailable: {}", e);
                    Arc::new(DisabledClassifier)
                }
            }
        } else {
            Arc::new(DisabledClassifier)
        };

    let calibrator = DepthCalibrator::new(config.depth_map);
    let mut orchestrator = PipelineOrchestrator::new(config.clone(), classifier, calibrator)
        .with_shutdown(install_ctrl_c());

    if config.output.save_annotated {
        let dir = Path::new(&config.output.dir).join("annotated");
        let writer = AnnotatedFrameWriter::new(&dir, config.cv.density_thr)?;
        info!("✓ Annotated frames → {}", dir.display());
        orchestrator = orchestrator.with_overlay(Box::new(writer));
    }

    Ok(orchestrator)
}

fn install_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping");
            let _ = tx.send(true);
        }
    });
    rx
}

fn report_file_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("analysis");
    format!("{}_report.json", stem)
}
