//! V4L2 capture device.
//!
//! Opens `/dev/video{sensor_id}`, requests packed BGR at the configured
//! geometry and streams through memory-mapped buffers. A device that only
//! agrees to RGB3 is accepted and swapped per frame; anything else fails
//! `open`. Flip methods are a CSI pipeline concept and are ignored here.

use anyhow::{Context, Result};
use ouroboros::self_referencing;
use std::time::Duration;

use super::format::{negotiated_order, PixelOrder};
use super::{DeviceDriver, FrameDevice};
use crate::config::CaptureConfig;

#[derive(Default)]
pub struct V4l2Driver;

impl V4l2Driver {
    pub fn new() -> Self {
        Self
    }
}

#[self_referencing]
struct V4l2Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl DeviceDriver for V4l2Driver {
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn FrameDevice>> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = format!("/dev/video{}", config.sensor_id());
        let mut device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width();
        format.height = config.height();
        format.fourcc = v4l::FourCC::new(b"BGR3");
        let format = device.set_format(&format).context("set v4l2 format")?;
        let order = negotiated_order(format.fourcc.repr, format.width, format.height, config)
            .with_context(|| format!("v4l2 device {}", path))?;

        let params = v4l::video::capture::Parameters::with_fps(config.framerate());
        if let Err(err) = device.set_params(&params) {
            log::warn!("V4l2Driver: failed to set fps on {}: {}", path, err);
        }
        if config.flip_method() != 0 {
            log::warn!(
                "V4l2Driver: flip_method {} is not supported on {}, ignoring",
                config.flip_method(),
                path
            );
        }

        let stream = V4l2StreamBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Driver: opened {} ({}x{})",
            path,
            config.width(),
            config.height()
        );
        Ok(Box::new(V4l2Device {
            path,
            order,
            stream: Some(stream),
        }))
    }
}

struct V4l2Device {
    path: String,
    order: PixelOrder,
    stream: Option<V4l2Stream>,
}

impl FrameDevice for V4l2Device {
    fn describe(&self) -> String {
        format!("v4l2 device {}", self.path)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        use v4l::io::traits::CaptureStream;

        let stream = self.stream.as_mut().context("v4l2 device already released")?;
        let result = stream.with_stream_mut(|stream| {
            stream.set_timeout(timeout);
            stream.next().map(|(buf, _meta)| buf.to_vec())
        });
        match result {
            Ok(mut pixels) => {
                self.order.to_bgr(&mut pixels);
                Ok(Some(pixels))
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(anyhow::Error::new(err).context("capture v4l2 frame")),
        }
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the stream unmaps the buffers and stops streaming before
        // the device node is closed.
        self.stream = None;
        log::info!("V4l2Driver: released {}", self.path);
        Ok(())
    }
}
