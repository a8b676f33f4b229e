//! Decoded frames.
//!
//! - `Frame`: immutable RGB8 image plus capture timestamp. Clones share pixels,
//!   so handing a frame to several consumers does not copy it.
//! - `EncodedFrame`: the PNG encoding of a `Frame`, produced once per frame for
//!   the live display.

use anyhow::{anyhow, Context, Result};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes per RGB8 pixel.
const RGB_CHANNELS: usize = 3;

/// Immutable decoded image.
#[derive(Clone)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock time the frame was read from its channel.
    pub captured_at: SystemTime,
    /// Per-channel counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from tightly packed RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            captured_at: SystemTime::now(),
            sequence,
        })
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_raw(), width, height, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Capture time in microseconds since the Unix epoch.
    pub fn capture_micros(&self) -> u128 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0)
    }

    /// Encode as PNG for display.
    pub fn encode_png(&self) -> Result<EncodedFrame> {
        let mut bytes = Vec::with_capacity(self.byte_len() / 2);
        PngEncoder::new(&mut bytes)
            .write_image(
                self.pixels(),
                self.width,
                self.height,
                ExtendedColorType::Rgb8,
            )
            .with_context(|| format!("encode {}x{} frame as png", self.width, self.height))?;
        Ok(EncodedFrame {
            png: bytes.into(),
            width: self.width,
            height: self.height,
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }
}

// Pixel data is deliberately left out of Debug output.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// PNG bytes of one frame.
#[derive(Clone)]
pub struct EncodedFrame {
    png: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    pub sequence: u64,
}

impl EncodedFrame {
    pub fn png_bytes(&self) -> &[u8] {
        &self.png
    }

    /// Capture time in microseconds since the Unix epoch.
    pub fn capture_micros(&self) -> u128 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0)
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("png_len", &self.png.len())
            .finish()
    }
}
