//! Frame sources.
//!
//! A source owns its pixel buffer and lends it out for exactly one pipeline
//! pass: [`FrameSource::capture`] borrows the source mutably, so a second
//! capture cannot be requested while a frame is still alive.

use crate::config::Config;
use crate::error::{FrameError, StartupError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType};
use nokhwa::{
    pixel_format::{LumaFormat, RgbFormat},
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Compressed JPEG bytes.
    Jpeg,
    /// One unsigned byte per pixel, row-major.
    Gray8,
}

#[derive(Debug)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    pub sequence: u64,
}

pub trait FrameSource {
    /// Most recent frame, or `None` when nothing is ready this tick.
    fn capture(&mut self) -> Result<Option<Frame<'_>>, FrameError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<Option<Frame<'_>>, FrameError> {
        (**self).capture()
    }
}

/// JPEG-encodes a frame into `out`, reusing its allocation. JPEG frames are
/// copied through unchanged.
pub fn encode_jpeg(frame: &Frame<'_>, quality: u8, out: &mut Vec<u8>) -> Result<(), FrameError> {
    out.clear();
    match frame.encoding {
        Encoding::Jpeg => out.extend_from_slice(frame.data),
        Encoding::Gray8 => {
            let mut encoder = JpegEncoder::new_with_quality(&mut *out, quality);
            encoder.encode(frame.data, frame.width, frame.height, ExtendedColorType::L8)?;
        }
    }
    Ok(())
}

/// Opens the configured source: a replay directory when one is set,
/// otherwise the camera.
pub fn open_source(cfg: &Config, encoding: Encoding) -> Result<Box<dyn FrameSource>, StartupError> {
    match &cfg.frames_dir {
        Some(dir) => {
            let source = ReplaySource::new(
                dir,
                cfg.frame_width,
                cfg.frame_height,
                encoding,
                cfg.jpeg_quality,
            );
            if source.is_empty() {
                return Err(StartupError::Camera(format!(
                    "no frames in {}",
                    dir.display()
                )));
            }
            debug!(dir = %dir.display(), frames = source.len(), "replaying frames");
            Ok(Box::new(source))
        }
        None => CameraSource::open(
            cfg.camera_index,
            cfg.frame_width,
            cfg.frame_height,
            encoding,
            cfg.jpeg_quality,
        )
        .map(|c| Box::new(c) as Box<dyn FrameSource>)
        .map_err(|e| StartupError::Camera(e.to_string())),
    }
}

fn load_frames(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(rd) => {
            let mut paths: Vec<PathBuf> = rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            paths.sort();
            if paths.is_empty() {
                error!("no frames found in {}", dir.display());
            }
            paths
        }
        Err(e) => {
            error!("failed to read {}: {e}", dir.display());
            Vec::new()
        }
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// Plays a directory of images in name order, forever. Images are scaled to
/// the configured sensor size so downstream stages see camera-shaped frames.
pub struct ReplaySource {
    frames: Vec<PathBuf>,
    index: usize,
    width: u32,
    height: u32,
    encoding: Encoding,
    quality: u8,
    sequence: u64,
    buffer: Vec<u8>,
}

impl ReplaySource {
    pub fn new(dir: &Path, width: u32, height: u32, encoding: Encoding, quality: u8) -> Self {
        Self {
            frames: load_frames(dir),
            index: 0,
            width,
            height,
            encoding,
            quality,
            sequence: 0,
            buffer: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn load(&mut self, path: &Path) -> Result<(), FrameError> {
        self.buffer.clear();
        let bytes = std::fs::read(path)?;
        if self.encoding == Encoding::Jpeg && is_jpeg(path) {
            self.buffer = bytes;
            return Ok(());
        }
        let img = image::load_from_memory(&bytes).map_err(|source| FrameError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let img = if img.width() != self.width || img.height() != self.height {
            img.resize_exact(self.width, self.height, FilterType::Triangle)
        } else {
            img
        };
        let gray = img.into_luma8();
        match self.encoding {
            Encoding::Gray8 => self.buffer.extend_from_slice(gray.as_raw()),
            Encoding::Jpeg => {
                let mut encoder = JpegEncoder::new_with_quality(&mut self.buffer, self.quality);
                encoder.encode(gray.as_raw(), self.width, self.height, ExtendedColorType::L8)?;
            }
        }
        Ok(())
    }
}

impl FrameSource for ReplaySource {
    fn capture(&mut self) -> Result<Option<Frame<'_>>, FrameError> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let path = self.frames[self.index % self.frames.len()].clone();
        self.index = (self.index + 1) % self.frames.len();
        self.load(&path)?;
        self.sequence += 1;
        Ok(Some(Frame {
            data: &self.buffer,
            width: self.width,
            height: self.height,
            encoding: self.encoding,
            sequence: self.sequence,
        }))
    }
}

/// Frames held in memory and handed out in order, cycling. A `None` slot
/// simulates a tick where the sensor had nothing ready.
pub struct MemorySource {
    frames: Vec<Option<Vec<u8>>>,
    width: u32,
    height: u32,
    encoding: Encoding,
    index: usize,
    sequence: u64,
}

impl MemorySource {
    pub fn new(width: u32, height: u32, encoding: Encoding) -> Self {
        Self {
            frames: Vec::new(),
            width,
            height,
            encoding,
            index: 0,
            sequence: 0,
        }
    }

    pub fn with_frame(mut self, data: Vec<u8>) -> Self {
        self.frames.push(Some(data));
        self
    }

    pub fn with_gap(mut self) -> Self {
        self.frames.push(None);
        self
    }
}

impl FrameSource for MemorySource {
    fn capture(&mut self) -> Result<Option<Frame<'_>>, FrameError> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let slot = self.index;
        self.index = (self.index + 1) % self.frames.len();
        match &self.frames[slot] {
            Some(data) => {
                self.sequence += 1;
                Ok(Some(Frame {
                    data,
                    width: self.width,
                    height: self.height,
                    encoding: self.encoding,
                    sequence: self.sequence,
                }))
            }
            None => Ok(None),
        }
    }
}

/// Live camera through nokhwa.
pub struct CameraSource {
    camera: Camera,
    width: u32,
    height: u32,
    encoding: Encoding,
    quality: u8,
    sequence: u64,
    buffer: Vec<u8>,
}

impl CameraSource {
    /// Opens camera `index`, preferring formats close to the requested size.
    pub fn open(
        index: u32,
        width: u32,
        height: u32,
        encoding: Encoding,
        quality: u8,
    ) -> Result<Self, FrameError> {
        let mut camera = None;
        for fmt in [FrameFormat::MJPEG, FrameFormat::YUYV, FrameFormat::GRAY] {
            let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                CameraFormat::new_from(width, height, fmt, 30),
            ));
            match Camera::new(CameraIndex::Index(index), req) {
                Ok(c) => {
                    camera = Some(c);
                    break;
                }
                Err(e) => debug!(?fmt, "camera format rejected: {e}"),
            }
        }
        let fallback = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = match camera {
            Some(c) => c,
            None => Camera::new(CameraIndex::Index(index), fallback)
                .map_err(|e| FrameError::Capture(e.to_string()))?,
        };
        camera
            .open_stream()
            .map_err(|e| FrameError::Capture(e.to_string()))?;
        debug!(format = ?camera.camera_format(), "camera stream opened");
        Ok(Self {
            camera,
            width,
            height,
            encoding,
            quality,
            sequence: 0,
            buffer: Vec::new(),
        })
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<Option<Frame<'_>>, FrameError> {
        let raw = match self.camera.frame() {
            Ok(f) => f,
            Err(e) => {
                warn!("frame capture failed: {e}");
                return Ok(None);
            }
        };
        self.buffer.clear();
        let resolution = raw.resolution();
        let native = resolution.width() == self.width && resolution.height() == self.height;
        if self.encoding == Encoding::Jpeg && native && raw.source_frame_format() == FrameFormat::MJPEG
        {
            self.buffer.extend_from_slice(raw.buffer());
        } else {
            let luma = raw
                .decode_image::<LumaFormat>()
                .map_err(|e| FrameError::Capture(e.to_string()))?;
            let gray = if native {
                luma
            } else {
                DynamicImage::ImageLuma8(luma)
                    .resize_exact(self.width, self.height, FilterType::Triangle)
                    .into_luma8()
            };
            match self.encoding {
                Encoding::Gray8 => self.buffer.extend_from_slice(gray.as_raw()),
                Encoding::Jpeg => {
                    let mut encoder = JpegEncoder::new_with_quality(&mut self.buffer, self.quality);
                    encoder.encode(gray.as_raw(), self.width, self.height, ExtendedColorType::L8)?;
                }
            }
        }
        self.sequence += 1;
        Ok(Some(Frame {
            data: &self.buffer,
            width: self.width,
            height: self.height,
            encoding: self.encoding,
            sequence: self.sequence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    #[test]
    fn replay_empty_directory_yields_nothing() {
        let dir = tempdir().unwrap();
        let mut src = ReplaySource::new(dir.path(), 8, 6, Encoding::Gray8, 80);
        assert!(src.is_empty());
        assert!(src.capture().unwrap().is_none());
    }

    #[test]
    fn replay_scales_and_cycles() {
        let dir = tempdir().unwrap();
        GrayImage::from_pixel(16, 12, Luma([7]))
            .save(dir.path().join("a.png"))
            .unwrap();
        GrayImage::from_pixel(8, 6, Luma([200]))
            .save(dir.path().join("b.png"))
            .unwrap();
        let mut src = ReplaySource::new(dir.path(), 8, 6, Encoding::Gray8, 80);
        assert_eq!(src.len(), 2);
        let first = src.capture().unwrap().unwrap();
        assert_eq!(first.data.len(), 48);
        assert!(first.data.iter().all(|p| *p == 7));
        let seq = first.sequence;
        let second = src.capture().unwrap().unwrap();
        assert_eq!(second.data[0], 200);
        assert_eq!(second.sequence, seq + 1);
        let third = src.capture().unwrap().unwrap();
        assert_eq!(third.data[0], 7);
    }

    #[test]
    fn replay_jpeg_output_decodes() {
        let dir = tempdir().unwrap();
        GrayImage::from_pixel(8, 8, Luma([90]))
            .save(dir.path().join("a.png"))
            .unwrap();
        let mut src = ReplaySource::new(dir.path(), 8, 8, Encoding::Jpeg, 90);
        let frame = src.capture().unwrap().unwrap();
        assert_eq!(frame.encoding, Encoding::Jpeg);
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(frame.data).unwrap();
        assert_eq!(decoded.width(), 8);
    }

    #[test]
    fn memory_source_gaps() {
        let mut src = MemorySource::new(2, 1, Encoding::Gray8)
            .with_frame(vec![1, 2])
            .with_gap();
        assert!(src.capture().unwrap().is_some());
        assert!(src.capture().unwrap().is_none());
        assert_eq!(src.capture().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn gray_frames_encode_to_jpeg() {
        let data = vec![128u8; 16 * 16];
        let frame = Frame {
            data: &data,
            width: 16,
            height: 16,
            encoding: Encoding::Gray8,
            sequence: 1,
        };
        let mut out = Vec::new();
        encode_jpeg(&frame, 80, &mut out).unwrap();
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }
}
