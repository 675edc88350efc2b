//! Capture settings: file + environment loading, validation, derived timing.
//!
//! `CaptureSettings` is the raw, possibly invalid view assembled from a config
//! file, environment overrides and the command line. `CaptureConfig` is what a
//! session runs with; it only exists once validation has passed, and it never
//! changes afterwards.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PluginError;

const CONFIG_ENV: &str = "CSI_CAMERA_CONFIG";
const DEFAULT_SENSOR_ID: i64 = 0;
const DEFAULT_FLIP_METHOD: i64 = 0;
const BYTES_PER_PIXEL: usize = 3;
const NANOS_PER_SEC: u32 = 1_000_000_000;
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Which device driver the binary should open.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Generated frames, no hardware required.
    #[default]
    Synthetic,
    /// Jetson CSI sensor through a GStreamer `nvarguscamerasrc` pipeline.
    Gstreamer,
    /// Local V4L2 device node `/dev/video{sensor_id}`.
    V4l2,
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(DriverKind::Synthetic),
            "gstreamer" => Ok(DriverKind::Gstreamer),
            "v4l2" => Ok(DriverKind::V4l2),
            other => Err(anyhow!("unknown driver '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureSettingsFile {
    #[serde(alias = "socket_id")]
    sensor_id: Option<i64>,
    capture_width: Option<i64>,
    capture_height: Option<i64>,
    framerate: Option<i64>,
    flip_method: Option<i64>,
    driver: Option<DriverKind>,
    read_timeout_ms: Option<u64>,
}

/// Unvalidated capture settings.
///
/// Integers are kept signed so that nonsensical values coming from a file or
/// the environment reach validation instead of failing to parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub sensor_id: i64,
    pub capture_width: Option<i64>,
    pub capture_height: Option<i64>,
    pub framerate: Option<i64>,
    pub flip_method: i64,
    pub driver: DriverKind,
    pub read_timeout_ms: Option<u64>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sensor_id: DEFAULT_SENSOR_ID,
            capture_width: None,
            capture_height: None,
            framerate: None,
            flip_method: DEFAULT_FLIP_METHOD,
            driver: DriverKind::default(),
            read_timeout_ms: None,
        }
    }
}

impl CaptureSettings {
    /// Settings for a sensor with the given geometry and rate.
    pub fn new(capture_width: i64, capture_height: i64, framerate: i64) -> Self {
        Self {
            capture_width: Some(capture_width),
            capture_height: Some(capture_height),
            framerate: Some(framerate),
            ..Self::default()
        }
    }

    /// Load settings from `path` (or `CSI_CAMERA_CONFIG` when `path` is None),
    /// then apply `CSI_CAMERA_*` environment overrides.
    ///
    /// Does not validate; see [`CaptureSettings::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));
        let file_cfg = match path {
            Some(path) => read_settings_file(path)?,
            None => CaptureSettingsFile::default(),
        };
        let mut settings = Self::from_file(file_cfg);
        settings.apply_env()?;
        Ok(settings)
    }

    fn from_file(file: CaptureSettingsFile) -> Self {
        Self {
            sensor_id: file.sensor_id.unwrap_or(DEFAULT_SENSOR_ID),
            capture_width: file.capture_width,
            capture_height: file.capture_height,
            framerate: file.framerate,
            flip_method: file.flip_method.unwrap_or(DEFAULT_FLIP_METHOD),
            driver: file.driver.unwrap_or_default(),
            read_timeout_ms: file.read_timeout_ms,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(sensor_id) = env_override("CSI_CAMERA_SENSOR_ID")? {
            self.sensor_id = sensor_id;
        }
        if let Some(width) = env_override("CSI_CAMERA_WIDTH")? {
            self.capture_width = Some(width);
        }
        if let Some(height) = env_override("CSI_CAMERA_HEIGHT")? {
            self.capture_height = Some(height);
        }
        if let Some(framerate) = env_override("CSI_CAMERA_FRAMERATE")? {
            self.framerate = Some(framerate);
        }
        if let Some(flip_method) = env_override("CSI_CAMERA_FLIP_METHOD")? {
            self.flip_method = flip_method;
        }
        if let Some(driver) = env_override("CSI_CAMERA_DRIVER")? {
            self.driver = driver;
        }
        if let Some(timeout) = env_override("CSI_CAMERA_READ_TIMEOUT_MS")? {
            self.read_timeout_ms = Some(timeout);
        }
        Ok(())
    }

    /// Check the numeric constraints and derive the session timing.
    pub fn validate(&self) -> Result<CaptureConfig, PluginError> {
        let width = positive_dimension("capture_width", self.capture_width)?;
        let height = positive_dimension("capture_height", self.capture_height)?;

        let framerate = match self.framerate {
            Some(rate) if rate >= 1 => u32::try_from(rate)
                .map_err(|_| PluginError::config(format!("framerate {} is out of range", rate)))?,
            Some(rate) => {
                return Err(PluginError::config(format!(
                    "framerate has to be an integer >= 1 (got {})",
                    rate
                )))
            }
            None => return Err(PluginError::config("framerate is required")),
        };

        let sensor_id = i32::try_from(self.sensor_id).map_err(|_| {
            PluginError::config(format!("sensor_id {} is out of range", self.sensor_id))
        })?;
        let flip_method = i32::try_from(self.flip_method).map_err(|_| {
            PluginError::config(format!("flip_method {} is out of range", self.flip_method))
        })?;

        let frame_byte_size = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(|| {
                PluginError::config(format!("frame size {}x{} overflows", width, height))
            })?;

        let tick_interval = TickInterval::from_framerate(framerate);
        let read_timeout = match self.read_timeout_ms {
            Some(0) => return Err(PluginError::config("read_timeout_ms must be greater than zero")),
            Some(ms) => Duration::from_millis(ms),
            None => (tick_interval.as_duration() * 4).max(MIN_READ_TIMEOUT),
        };

        Ok(CaptureConfig {
            sensor_id,
            width,
            height,
            framerate,
            flip_method,
            frame_byte_size,
            tick_interval,
            backoff_interval: tick_interval.as_duration() * 2 / 5,
            read_timeout,
        })
    }
}

fn positive_dimension(name: &str, value: Option<i64>) -> Result<u32, PluginError> {
    match value {
        Some(v) if v > 0 => u32::try_from(v)
            .map_err(|_| PluginError::config(format!("{} {} is out of range", name, v))),
        Some(v) => Err(PluginError::config(format!(
            "{} must be greater than zero (got {})",
            name, v
        ))),
        None => Err(PluginError::config(format!("{} is required", name))),
    }
}

/// Collector period: whole seconds plus a nanosecond remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickInterval {
    pub secs: u64,
    pub nanos: u32,
}

impl TickInterval {
    /// `1 / framerate`. A framerate of 1 yields exactly one second.
    pub fn from_framerate(framerate: u32) -> Self {
        let nanos = NANOS_PER_SEC / framerate.max(1);
        if nanos == NANOS_PER_SEC {
            Self { secs: 1, nanos: 0 }
        } else {
            Self { secs: 0, nanos }
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }
}

/// Validated, immutable capture configuration for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    sensor_id: i32,
    width: u32,
    height: u32,
    framerate: u32,
    flip_method: i32,
    frame_byte_size: usize,
    tick_interval: TickInterval,
    backoff_interval: Duration,
    read_timeout: Duration,
}

impl CaptureConfig {
    pub fn sensor_id(&self) -> i32 {
        self.sensor_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn flip_method(&self) -> i32 {
        self.flip_method
    }

    /// `width * height * 3`, fixed for the session.
    pub fn frame_byte_size(&self) -> usize {
        self.frame_byte_size
    }

    pub fn tick_interval(&self) -> TickInterval {
        self.tick_interval
    }

    /// Capture thread idle/retry pause, 40% of the tick interval.
    pub fn backoff_interval(&self) -> Duration {
        self.backoff_interval
    }

    /// Upper bound on a single device read.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

fn read_settings_file(path: &Path) -> Result<CaptureSettingsFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_override<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| anyhow!("{} has an invalid value '{}': {}", key, raw, e))
}
