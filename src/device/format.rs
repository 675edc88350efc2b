//! Checks on the pixel format a device actually agreed to.
//!
//! Frames leave the capture thread as packed BGR, 3 bytes per pixel. A device
//! that negotiates anything else has to be refused at open time; otherwise
//! every read fails the frame size check and the session never produces a
//! record.

use anyhow::{anyhow, Result};

use crate::config::CaptureConfig;

/// Channel order of a negotiated packed 24-bit format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelOrder {
    /// `BGR3`, already what frames carry.
    Bgr,
    /// `RGB3`, swapped to BGR on every read.
    Rgb,
}

impl PixelOrder {
    /// Bring `pixels` into BGR order in place.
    pub fn to_bgr(self, pixels: &mut [u8]) {
        if self == PixelOrder::Rgb {
            for pixel in pixels.chunks_exact_mut(3) {
                pixel.swap(0, 2);
            }
        }
    }
}

/// Validate the fourcc and geometry returned by format negotiation against
/// `config`.
pub fn negotiated_order(
    fourcc: [u8; 4],
    width: u32,
    height: u32,
    config: &CaptureConfig,
) -> Result<PixelOrder> {
    let order = match &fourcc {
        b"BGR3" => PixelOrder::Bgr,
        b"RGB3" => PixelOrder::Rgb,
        other => {
            return Err(anyhow!(
                "device negotiated pixel format {}, packed BGR3 or RGB3 is required",
                String::from_utf8_lossy(other)
            ))
        }
    };
    if width != config.width() || height != config.height() {
        return Err(anyhow!(
            "device offers {}x{}, configured {}x{}",
            width,
            height,
            config.width(),
            config.height()
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;

    fn config() -> CaptureConfig {
        CaptureSettings::new(640, 480, 10)
            .validate()
            .expect("valid settings")
    }

    #[test]
    fn accepts_packed_24_bit_formats() -> Result<()> {
        assert_eq!(negotiated_order(*b"BGR3", 640, 480, &config())?, PixelOrder::Bgr);
        assert_eq!(negotiated_order(*b"RGB3", 640, 480, &config())?, PixelOrder::Rgb);
        Ok(())
    }

    #[test]
    fn refuses_formats_that_cannot_fill_a_frame() {
        for fourcc in [*b"YUYV", *b"MJPG", *b"NV12"] {
            let err = negotiated_order(fourcc, 640, 480, &config())
                .expect_err("only packed 24-bit formats are usable");
            assert!(err.to_string().contains(std::str::from_utf8(&fourcc).unwrap_or("")));
        }
    }

    #[test]
    fn refuses_other_geometry() {
        let err = negotiated_order(*b"BGR3", 320, 240, &config()).expect_err("wrong size");
        assert!(err.to_string().contains("320x240"));
    }

    #[test]
    fn rgb_is_swapped_to_bgr() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6];
        PixelOrder::Rgb.to_bgr(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 6, 5, 4]);

        PixelOrder::Bgr.to_bgr(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 6, 5, 4]);
    }
}
