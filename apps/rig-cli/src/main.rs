use anyhow::Result;
use camera_rig::mock::{MockPatternDetector, MockStereoSolver, ScriptedSourceFactory};
use camera_rig::{
    load_config_file, CameraManager, DeviceSourceFactory, PatternDetector, RigConfig,
    SourceFactory, StereoSolver,
};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vision_capture::{enumerate_devices, MockDevice, SourceId};

#[derive(Parser, Debug)]
#[command(
    name = "rig",
    version,
    about = "Multi-camera rig: synchronized capture and stereo calibration",
    disable_help_subcommand = true
)]
struct Cli {
    /// YAML configuration file (defaults apply to missing keys)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List camera devices that open successfully
    List {
        /// Highest device index to probe (exclusive)
        #[arg(long, default_value_t = 8)]
        max: SourceId,
        /// Probe OpenCV devices instead of mock cameras
        #[arg(long, action = ArgAction::SetTrue)]
        opencv: bool,
    },
    /// Print synchronized batches
    Stream {
        /// Source ids, comma separated
        #[arg(long, value_delimiter = ',', default_value = "0,1")]
        sources: Vec<SourceId>,
        /// Number of batches to print
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Use scripted sources whose clocks are offset by this many ms
        #[arg(long)]
        skew_ms: Option<i64>,
    },
    /// Run the calibration procedure and print the report as JSON
    Calibrate {
        /// Source ids, comma separated
        #[arg(long, value_delimiter = ',', default_value = "0,1")]
        sources: Vec<SourceId>,
        /// Samples per pair (overrides the config)
        #[arg(long)]
        samples: Option<usize>,
        /// Use OpenCV cameras, detector and solver
        #[arg(long, action = ArgAction::SetTrue)]
        opencv: bool,
    },
    /// Calibrate, then project a normalized image point between cameras
    Project {
        #[arg(long)]
        from: SourceId,
        #[arg(long)]
        to: SourceId,
        #[arg(long, default_value_t = 0.5)]
        u: f64,
        #[arg(long, default_value_t = 0.5)]
        v: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::List { max, opencv } => list_devices(&config, max, opencv),
        Commands::Stream {
            sources,
            count,
            skew_ms,
        } => stream(config, &sources, count, skew_ms).await,
        Commands::Calibrate {
            sources,
            samples,
            opencv,
        } => {
            let manager = calibrate(config, &sources, samples, opencv).await?;
            if let Some(report) = manager.calibration_report() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            manager.stop().await?;
            Ok(())
        }
        Commands::Project { from, to, u, v } => {
            let mut ids = vec![from, to];
            ids.dedup();
            if ids.len() < 2 {
                // Calibration needs a second camera even for a self-projection.
                ids.push(from + 1);
            }
            let manager = calibrate(config, &ids, None, false).await?;
            let projection = manager
                .project(from, to, u, v)
                .map_err(|e| anyhow::anyhow!("projection failed: {e}"))?;
            println!("{}", serde_json::to_string_pretty(&projection)?);
            manager.stop().await?;
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<RigConfig> {
    match path {
        Some(path) => load_config_file(path),
        None => Ok(RigConfig::default()),
    }
}

fn list_devices(config: &RigConfig, max: SourceId, opencv: bool) -> Result<()> {
    let requested = config.capture.to_capture_config().requested;
    let devices = if opencv {
        #[cfg(feature = "opencv")]
        {
            enumerate_devices::<vision_capture::OpenCvDevice>(max, requested)
        }
        #[cfg(not(feature = "opencv"))]
        {
            anyhow::bail!("OpenCV backend not enabled at compile time")
        }
    } else {
        enumerate_devices::<MockDevice>(max, requested)
    };
    if devices.is_empty() {
        println!("no devices found");
    }
    for dev in devices {
        println!(
            "{}: {} {}x{}",
            dev.index, dev.backend, dev.resolution.width, dev.resolution.height
        );
    }
    Ok(())
}

fn source_factory(config: &RigConfig, opencv: bool) -> Result<Arc<dyn SourceFactory>> {
    let capture = config.capture.to_capture_config();
    if opencv {
        #[cfg(feature = "opencv")]
        return Ok(Arc::new(
            DeviceSourceFactory::<vision_capture::OpenCvDevice>::new(capture),
        ));
        #[cfg(not(feature = "opencv"))]
        anyhow::bail!("OpenCV backend not enabled at compile time");
    }
    Ok(Arc::new(DeviceSourceFactory::<MockDevice>::new(capture)))
}

type Backend = (Arc<dyn PatternDetector>, Arc<dyn StereoSolver>);

fn calibration_backend(config: &RigConfig, opencv: bool) -> Result<Backend> {
    let board = &config.calibration.board;
    if opencv {
        #[cfg(feature = "opencv")]
        return Ok((
            Arc::new(camera_rig::OpenCvChessboardDetector::new(board.rows, board.cols)),
            Arc::new(camera_rig::OpenCvStereoSolver::new()),
        ));
        #[cfg(not(feature = "opencv"))]
        anyhow::bail!("OpenCV backend not enabled at compile time");
    }
    Ok((
        Arc::new(MockPatternDetector::always(board.rows, board.cols)),
        Arc::new(MockStereoSolver::new()),
    ))
}

async fn start(manager: &Arc<CameraManager>, sources: &[SourceId]) -> Result<()> {
    let m = manager.clone();
    let ids = sources.to_vec();
    tokio::task::spawn_blocking(move || m.start(&ids))
        .await?
        .map_err(|e| anyhow::anyhow!("starting cameras failed: {e}"))
}

async fn stream(
    config: RigConfig,
    sources: &[SourceId],
    count: u32,
    skew_ms: Option<i64>,
) -> Result<()> {
    let factory: Arc<dyn SourceFactory> = match skew_ms {
        Some(skew) => {
            let step = 33;
            Arc::new(
                sources
                    .iter()
                    .enumerate()
                    .fold(ScriptedSourceFactory::new(), |f, (i, &id)| {
                        f.with_source(id, 1_000 + i as i64 * skew, step)
                    }),
            )
        }
        None => source_factory(&config, false)?,
    };
    let manager = Arc::new(CameraManager::new(config, factory)?);
    start(&manager, sources).await?;

    for n in 0..count {
        let m = manager.clone();
        let batch = tokio::task::spawn_blocking(move || m.get_batch()).await?;
        match batch {
            Ok(batch) => {
                let stamps: Vec<String> = batch
                    .iter()
                    .map(|(id, f)| format!("{id}@{}", f.timestamp_ms))
                    .collect();
                println!(
                    "batch {n}: {} spread={}ms",
                    stamps.join(" "),
                    batch.spread_ms()
                );
            }
            Err(e) if e.is_recoverable() => warn!(error = %e, "batch skipped"),
            Err(e) => {
                manager.stop().await?;
                return Err(anyhow::anyhow!("batch failed: {e}"));
            }
        }
    }

    manager.stop().await?;
    Ok(())
}

async fn calibrate(
    mut config: RigConfig,
    sources: &[SourceId],
    samples: Option<usize>,
    opencv: bool,
) -> Result<Arc<CameraManager>> {
    if let Some(samples) = samples {
        config.calibration.target_samples = samples;
    }
    let factory = source_factory(&config, opencv)?;
    let (detector, solver) = calibration_backend(&config, opencv)?;
    let manager = Arc::new(
        CameraManager::new(config, factory)?.with_calibration_backend(detector, solver),
    );
    start(&manager, sources).await?;

    let run_id = manager.begin_calibration()?;
    info!(%run_id, "calibration running");
    while manager.calibration_status().is_running() {
        tokio::time::sleep(Duration::from_millis(250)).await;
        info!(
            progress = manager.calibration_progress(),
            status = ?manager.calibration_status(),
            "calibrating"
        );
    }
    manager.wait_for_calibration().await;
    Ok(manager)
}
