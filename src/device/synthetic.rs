//! Synthetic capture device.
//!
//! Produces patterned BGR frames at the configured geometry without any
//! hardware. Failures and read latency can be injected to exercise the
//! capture thread's retry path.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{DeviceDriver, FrameDevice};
use crate::config::CaptureConfig;

/// Fault and latency injection for synthetic devices.
#[derive(Clone, Debug, Default)]
pub struct SyntheticOptions {
    /// Probability in `0.0..=1.0` that a read fails.
    pub failure_rate: f64,
    /// Time each read takes. Reads slower than the caller's timeout return
    /// no frame after waiting the full timeout.
    pub read_latency: Duration,
}

pub struct SyntheticDriver {
    options: SyntheticOptions,
}

impl SyntheticDriver {
    pub fn new(options: SyntheticOptions) -> Self {
        Self { options }
    }
}

impl DeviceDriver for SyntheticDriver {
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn FrameDevice>> {
        if !(0.0..=1.0).contains(&self.options.failure_rate) {
            return Err(anyhow!(
                "synthetic failure_rate must be within 0..=1 (got {})",
                self.options.failure_rate
            ));
        }
        log::info!(
            "SyntheticDriver: opened sensor {} ({}x{} @ {} fps)",
            config.sensor_id(),
            config.width(),
            config.height(),
            config.framerate()
        );
        Ok(Box::new(SyntheticDevice {
            sensor_id: config.sensor_id(),
            frame_size: config.frame_byte_size(),
            options: self.options.clone(),
            frame_count: 0,
            scene_state: 0,
            released: false,
        }))
    }
}

struct SyntheticDevice {
    sensor_id: i32,
    frame_size: usize,
    options: SyntheticOptions,
    frame_count: u64,
    /// Simulated scene, changes every 50 frames.
    scene_state: u8,
    released: bool,
}

impl SyntheticDevice {
    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; self.frame_size];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameDevice for SyntheticDevice {
    fn describe(&self) -> String {
        format!("synthetic sensor {}", self.sensor_id)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.released {
            return Err(anyhow!("synthetic device already released"));
        }
        if !self.options.read_latency.is_zero() {
            std::thread::sleep(self.options.read_latency.min(timeout));
            if self.options.read_latency > timeout {
                return Ok(None);
            }
        }
        if self.options.failure_rate > 0.0 && rand::random::<f64>() < self.options.failure_rate {
            return Err(anyhow!("synthetic read failure"));
        }

        self.frame_count += 1;
        Ok(Some(self.generate_pixels()))
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        log::info!("SyntheticDriver: released sensor {}", self.sensor_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;

    fn config() -> CaptureConfig {
        CaptureSettings::new(64, 48, 10)
            .validate()
            .expect("valid settings")
    }

    #[test]
    fn produces_full_size_frames() -> Result<()> {
        let mut device = SyntheticDriver::new(SyntheticOptions::default()).open(&config())?;

        let frame = device.read_frame(Duration::from_millis(10))?.expect("frame");
        assert_eq!(frame.len(), 64 * 48 * 3);

        let next = device.read_frame(Duration::from_millis(10))?.expect("frame");
        assert_ne!(frame, next, "consecutive frames should differ");
        Ok(())
    }

    #[test]
    fn always_failing_device_never_returns_frames() -> Result<()> {
        let options = SyntheticOptions {
            failure_rate: 1.0,
            ..SyntheticOptions::default()
        };
        let mut device = SyntheticDriver::new(options).open(&config())?;
        for _ in 0..10 {
            assert!(device.read_frame(Duration::from_millis(10)).is_err());
        }
        Ok(())
    }

    #[test]
    fn slow_read_times_out_without_frame() -> Result<()> {
        let options = SyntheticOptions {
            read_latency: Duration::from_millis(200),
            ..SyntheticOptions::default()
        };
        let mut device = SyntheticDriver::new(options).open(&config())?;
        assert!(device.read_frame(Duration::from_millis(5))?.is_none());
        Ok(())
    }

    #[test]
    fn rejects_invalid_failure_rate() {
        let options = SyntheticOptions {
            failure_rate: 1.5,
            ..SyntheticOptions::default()
        };
        assert!(SyntheticDriver::new(options).open(&config()).is_err());
    }

    #[test]
    fn released_device_refuses_reads() -> Result<()> {
        let mut device = SyntheticDriver::new(SyntheticOptions::default()).open(&config())?;
        device.release()?;
        assert!(device.read_frame(Duration::from_millis(1)).is_err());
        Ok(())
    }
}
