//! Grayscale frame to classifier input.
//!
//! The transform is a centred crop, replication of the single intensity into
//! every channel, and a shift of `0..=255` into `-128..=127`. There is no
//! resampling, and the destination is provided by the caller so a cycle
//! never allocates.

use crate::error::{FrameError, StartupError};
use crate::frame::{Encoding, Frame};

/// Subtracted from every unsigned intensity.
pub const ZERO_POINT: i16 = 128;

/// Square crop region inside a source frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub edge: u32,
}

impl CropWindow {
    /// Centres an `edge`-sized square. The offset is floored, so when the
    /// spare pixels are odd the extra one is dropped on the high side.
    pub fn centered(width: u32, height: u32, edge: u32) -> Option<Self> {
        if edge == 0 || edge > width || edge > height {
            return None;
        }
        Some(Self {
            x: (width - edge) / 2,
            y: (height - edge) / 2,
            edge,
        })
    }

    /// Bottom-right pixel, inclusive.
    pub fn last(&self) -> (u32, u32) {
        (self.x + self.edge - 1, self.y + self.edge - 1)
    }
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    channels: usize,
    window: CropWindow,
}

impl Preprocessor {
    pub fn new(width: u32, height: u32, edge: u32, channels: usize) -> Result<Self, StartupError> {
        let window = CropWindow::centered(width, height, edge).ok_or_else(|| {
            StartupError::Preprocess(format!("cannot crop {edge}x{edge} from {width}x{height}"))
        })?;
        if channels == 0 {
            return Err(StartupError::Preprocess("channel count is zero".into()));
        }
        Ok(Self {
            width,
            height,
            channels,
            window,
        })
    }

    pub fn window(&self) -> CropWindow {
        self.window
    }

    /// Number of values written per frame.
    pub fn output_len(&self) -> usize {
        let edge = self.window.edge as usize;
        edge * edge * self.channels
    }

    /// Crops `pixels` (row-major, one byte per pixel) into `dst` in
    /// row, column, channel order.
    pub fn apply(&self, pixels: &[u8], dst: &mut [i8]) -> Result<(), FrameError> {
        let src_len = self.width as usize * self.height as usize;
        if pixels.len() != src_len || dst.len() != self.output_len() {
            return Err(FrameError::Shape(format!(
                "got {} source bytes and {} destination slots, expected {} and {}",
                pixels.len(),
                dst.len(),
                src_len,
                self.output_len()
            )));
        }
        let stride = self.width as usize;
        let edge = self.window.edge as usize;
        let (x0, y0) = (self.window.x as usize, self.window.y as usize);
        let row_len = edge * self.channels;
        for (row, out) in dst.chunks_exact_mut(row_len).enumerate() {
            let start = (y0 + row) * stride + x0;
            let src_row = &pixels[start..start + edge];
            for (px, slot) in src_row.iter().zip(out.chunks_exact_mut(self.channels)) {
                slot.fill((*px as i16 - ZERO_POINT) as i8);
            }
        }
        Ok(())
    }

    pub fn apply_frame(&self, frame: &Frame<'_>, dst: &mut [i8]) -> Result<(), FrameError> {
        if frame.encoding != Encoding::Gray8 || frame.width != self.width || frame.height != self.height
        {
            return Err(FrameError::Shape(format!(
                "{:?} {}x{} frame, expected Gray8 {}x{}",
                frame.encoding, frame.width, frame.height, self.width, self.height
            )));
        }
        self.apply(frame.data, dst)
    }
}
