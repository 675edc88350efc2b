//! Jetson CSI capture through GStreamer.
//!
//! Builds the pipeline from [`csi_pipeline`], plays it, and pulls one sample
//! per read from the appsink with the caller's timeout.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::pipeline::{csi_pipeline, APPSINK_NAME};
use super::{DeviceDriver, FrameDevice};
use crate::config::CaptureConfig;

#[derive(Default)]
pub struct GstreamerDriver;

impl GstreamerDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for GstreamerDriver {
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn FrameDevice>> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = csi_pipeline(config);
        log::debug!("GstreamerDriver: pipeline {}", description);
        let pipeline = gstreamer::parse::launch(&description)
            .context("build CSI pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("CSI pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name(APPSINK_NAME)
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set CSI pipeline to Playing")?;

        log::info!(
            "GstreamerDriver: opened sensor {} ({}x{} @ {} fps, flip {})",
            config.sensor_id(),
            config.width(),
            config.height(),
            config.framerate(),
            config.flip_method()
        );

        Ok(Box::new(GstreamerDevice {
            sensor_id: config.sensor_id(),
            pipeline,
            appsink,
            last_error: None,
        }))
    }
}

struct GstreamerDevice {
    sensor_id: i32,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    last_error: Option<String>,
}

impl GstreamerDevice {
    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameDevice for GstreamerDevice {
    fn describe(&self) -> String {
        format!("CSI sensor {} (gstreamer)", self.sensor_id)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }

        let clock_timeout = gstreamer::ClockTime::from_nseconds(timeout.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(clock_timeout) else {
            if self.appsink.is_eos() {
                return Err(anyhow!("CSI stream ended"));
            }
            return Ok(None);
        };
        sample_to_pixels(&sample).map(Some)
    }

    fn release(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Null)
            .context("set CSI pipeline to Null")?;
        log::info!("GstreamerDriver: released sensor {}", self.sensor_id);
        Ok(())
    }
}

impl Drop for GstreamerDevice {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Copy a packed BGR sample out of the appsink, dropping row padding.
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<Vec<u8>> {
    let buffer = sample.buffer().context("CSI sample missing buffer")?;
    let caps = sample.caps().context("CSI sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse CSI caps as video info")?;

    let width = info.width() as usize;
    let height = info.height() as usize;
    let row_bytes = width * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map CSI buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(data.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("CSI buffer row is out of bounds")?,
        );
    }
    Ok(pixels)
}
