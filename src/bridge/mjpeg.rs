//! HTTP MJPEG capture channel.
//!
//! Reads a `multipart/x-mixed-replace` JPEG stream (the format phone webcam
//! apps such as DroidCam serve on `/video`) and decodes each JPEG into a
//! `Frame`. Servers that answer with a single JPEG are polled per read.
//!
//! Every read is bounded by `read_timeout`; a timed-out read is reported as a
//! failed read so the worker's failure counter sees hung streams.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use url::Url;

use super::CaptureChannel;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

/// Configuration for an MJPEG channel.
#[derive(Clone, Debug)]
pub struct MjpegConfig {
    /// Stream URL, http(s) only.
    pub url: String,
    /// Upper bound on connecting and on each socket read.
    pub read_timeout: Duration,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:4747/video".to_string(),
            read_timeout: Duration::from_secs(5),
        }
    }
}

pub struct MjpegChannel {
    config: MjpegConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    sequence: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl MjpegChannel {
    pub fn new(config: MjpegConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse mjpeg url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported mjpeg scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.read_timeout)
            .timeout_read(config.read_timeout)
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            sequence: 0,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.config.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl CaptureChannel for MjpegChannel {
    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("mjpeg channel opened: {}", self.config.url);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let jpeg = match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(reader)) => reader.read_next_jpeg()?,
            Some(HttpStream::SingleJpeg) => self.fetch_single_jpeg()?,
            None => return Err(anyhow!("mjpeg channel not open; call open() first")),
        };
        if jpeg.is_empty() {
            return Ok(None);
        }
        self.sequence += 1;
        decode_jpeg(&jpeg, self.sequence).map(Some)
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("mjpeg channel closed: {}", self.config.url);
        }
    }
}

/// Splits a byte stream into JPEG images by SOI/EOI markers.
pub(crate) struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub(crate) fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        while find_jpeg_bounds(&self.buffer).is_none() {
            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // No end marker within the size limit: drop the garbage, keeping
            // the last byte in case it starts a marker.
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let stale = self.buffer.len() - 1;
                self.buffer.drain(..stale);
            }
        }
        let (start, end) = find_jpeg_bounds(&self.buffer)
            .ok_or_else(|| anyhow!("mjpeg frame boundary lost"))?;
        let jpeg = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Ok(jpeg)
    }
}

fn decode_jpeg(bytes: &[u8], sequence: u64) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Frame::from_image(image.into_rgb8(), sequence)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, ImageEncoder};
    use std::io::Cursor;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let pixels = vec![90u8; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new(&mut out)
            .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    fn multipart(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    #[test]
    fn finds_jpeg_bounds_between_boundaries() {
        let buffer = [0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x33];
        assert_eq!(find_jpeg_bounds(&buffer), Some((2, 8)));
        assert_eq!(find_jpeg_bounds(&buffer[..7]), None);
        assert_eq!(find_jpeg_bounds(&[0xFF]), None);
    }

    #[test]
    fn reader_splits_consecutive_images() -> Result<()> {
        let first = jpeg_bytes(8, 8);
        let second = jpeg_bytes(16, 4);
        let body = multipart(&[first.clone(), second.clone()]);
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));

        let a = reader.read_next_jpeg()?;
        let b = reader.read_next_jpeg()?;
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(reader.read_next_jpeg().is_err(), "stream end is a read error");
        Ok(())
    }

    #[test]
    fn decoded_frames_carry_dimensions() -> Result<()> {
        let frame = decode_jpeg(&jpeg_bytes(16, 4), 7)?;
        assert_eq!((frame.width, frame.height), (16, 4));
        assert_eq!(frame.sequence, 7);
        Ok(())
    }

    #[test]
    fn rejects_non_http_urls() {
        let config = MjpegConfig {
            url: "udp://127.0.0.1:5000".to_string(),
            ..MjpegConfig::default()
        };
        assert!(MjpegChannel::new(config).is_err());
    }

    #[test]
    fn read_before_open_fails() -> Result<()> {
        let mut channel = MjpegChannel::new(MjpegConfig::default())?;
        assert!(channel.read_frame().is_err());
        Ok(())
    }
}
