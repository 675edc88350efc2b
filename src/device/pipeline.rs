//! GStreamer pipeline description for Jetson CSI sensors.
//!
//! The sensor delivers NV12 in NVMM memory; `nvvidconv` flips and converts to
//! BGRx, `videoconvert` drops the padding byte so the appsink sees packed BGR
//! at exactly `width * height * 3` bytes per frame.

use crate::config::CaptureConfig;

/// Name of the appsink element the driver pulls samples from.
pub const APPSINK_NAME: &str = "appsink";

/// Build the `gst-launch` style description for `config`.
///
/// The appsink keeps a single buffer and drops older ones; without that the
/// sensor queue adds seconds of latency between capture and read.
pub fn csi_pipeline(config: &CaptureConfig) -> String {
    let width = config.width();
    let height = config.height();
    format!(
        "nvarguscamerasrc sensor_id={sensor} ! \
         video/x-raw(memory:NVMM), width=(int){width}, height=(int){height}, \
         format=(string)NV12, framerate=(fraction){fps}/1 ! \
         nvvidconv flip-method={flip} ! \
         video/x-raw, width=(int){width}, height=(int){height}, format=(string)BGRx ! \
         videoconvert ! video/x-raw, format=(string)BGR ! \
         appsink name={sink} drop=true max-buffers=1 sync=false",
        sensor = config.sensor_id(),
        fps = config.framerate(),
        flip = config.flip_method(),
        sink = APPSINK_NAME,
    )
}
