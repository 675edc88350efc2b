//! csi_camera - run a CSI camera input until interrupted
//!
//! This binary:
//! 1. Loads capture settings (file, CSI_CAMERA_* env, command line)
//! 2. Opens the selected device driver
//! 3. Starts a capture session on a host timer loop
//! 4. Emits one JSON line per drained frame (pixels, or a summary)
//! 5. Exits the session cleanly on Ctrl-C or after --run-seconds

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use csi_camera_input::device::{driver_for, SyntheticDriver, SyntheticOptions};
use csi_camera_input::{
    CaptureSession, CaptureSettings, DeviceDriver, DriverKind, Emitter, FrameJsonEmitter,
    HostLoop, JsonLinesEmitter,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const MAX_IDLE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    /// `[timestamp, {"frame": <base64 pixels>}]` per record.
    Frame,
    /// Timestamps, frame size and SHA-256; no pixels.
    Summary,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Capture frames from a CSI camera and emit at most one record per tick"
)]
struct Args {
    /// Settings file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "CSI_CAMERA_CONFIG")]
    config: Option<PathBuf>,

    /// Sensor id (CSI socket, or /dev/videoN for v4l2).
    #[arg(long)]
    sensor_id: Option<i64>,

    /// Capture width in pixels.
    #[arg(long)]
    width: Option<i64>,

    /// Capture height in pixels.
    #[arg(long)]
    height: Option<i64>,

    /// Frames per second; also the collection rate.
    #[arg(long)]
    framerate: Option<i64>,

    /// nvvidconv flip method.
    #[arg(long)]
    flip_method: Option<i64>,

    /// Device driver.
    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// Upper bound on a single device read, in milliseconds.
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Write records to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Record layout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Frame)]
    format: OutputFormat,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_seconds: Option<u64>,

    /// Synthetic driver only: probability that a read fails.
    #[arg(long, default_value_t = 0.0)]
    synthetic_failure_rate: f64,
}

impl Args {
    fn settings(&self) -> Result<CaptureSettings> {
        let mut settings = CaptureSettings::load(self.config.as_deref())?;
        if let Some(sensor_id) = self.sensor_id {
            settings.sensor_id = sensor_id;
        }
        if let Some(width) = self.width {
            settings.capture_width = Some(width);
        }
        if let Some(height) = self.height {
            settings.capture_height = Some(height);
        }
        if let Some(framerate) = self.framerate {
            settings.framerate = Some(framerate);
        }
        if let Some(flip_method) = self.flip_method {
            settings.flip_method = flip_method;
        }
        if let Some(driver) = self.driver {
            settings.driver = driver;
        }
        if let Some(timeout) = self.read_timeout_ms {
            settings.read_timeout_ms = Some(timeout);
        }
        Ok(settings)
    }

    fn driver(&self, kind: DriverKind) -> Result<Box<dyn DeviceDriver>> {
        if kind == DriverKind::Synthetic {
            return Ok(Box::new(SyntheticDriver::new(SyntheticOptions {
                failure_rate: self.synthetic_failure_rate,
                ..SyntheticOptions::default()
            })));
        }
        driver_for(kind)
    }

    fn emitter(&self) -> Result<Box<dyn Emitter>> {
        let out: Box<dyn Write + Send> = match &self.output {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("create output file {}", path.display()))?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(std::io::stdout()),
        };
        Ok(match self.format {
            OutputFormat::Frame => Box::new(FrameJsonEmitter::new(out)),
            OutputFormat::Summary => Box::new(JsonLinesEmitter::new(out)),
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = args.settings()?;
    let mut driver = args.driver(settings.driver)?;
    let emitter = args.emitter()?;

    let mut host = HostLoop::new();
    let session = CaptureSession::init(&settings, driver.as_mut(), emitter, &mut host)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })
    .context("set Ctrl-C handler")?;

    let deadline = args
        .run_seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    log::info!(
        "csi_camera running (sensor {}, {:?} driver)",
        session.config().sensor_id(),
        settings.driver
    );

    let mut last_health_log = Instant::now();
    host.run_while(MAX_IDLE, || {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = session.stats();
            log::info!(
                "capture: {} frames, {} read failures, {} skipped; drain: {} ticks, {} emitted",
                stats.frames_captured,
                stats.read_failures,
                stats.captures_skipped,
                stats.ticks,
                stats.records_emitted
            );
            last_health_log = Instant::now();
        }
        true
    });

    log::info!("shutdown requested, stopping capture");
    session.exit(&mut host);
    Ok(())
}
