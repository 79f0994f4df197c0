//! Frames
//!
//! Decoded frame records and the ordered store an image keeps them in.

use std::sync::Arc;

use tiny_skia::{IntSize, Pixmap};

use crate::error::{ImageError, Result};
use crate::geom::IntRect;

/// Largest accepted frame side
const MAX_DIMENSION: i32 = 32767;

/// What happens to a frame's region after it was shown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisposalMethod {
    /// Leave pixels in place
    #[default]
    Keep,
    /// Clear the frame's rect to transparent
    Clear,
    /// Clear the whole canvas
    ClearAll,
    /// Restore the canvas to what it was before the frame
    RestorePrevious,
}

/// How a frame combines with the canvas beneath it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendMethod {
    /// Alpha-composite over existing pixels
    #[default]
    Over,
    /// Replace existing pixels
    Source,
}

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Premultiplied RGBA
    Rgba,
    /// RGBA with every pixel opaque
    Rgbx,
    /// Indices into a frame palette
    Paletted,
}

#[derive(Debug, Clone)]
enum FrameBuffer {
    Pixels(Arc<Pixmap>),
    Paletted { indices: Vec<u8>, palette: Vec<[u8; 4]> },
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position within the canvas
    rect: IntRect,
    format: PixelFormat,
    palette_depth: u8,
    buffer: FrameBuffer,
    disposal: DisposalMethod,
    blend: BlendMethod,
    /// Display duration in ms, -1 for forever
    timeout: i32,
    has_alpha: bool,
    compositing_failed: bool,
    /// Advisory write/read locks
    lock_count: u32,
}

impl Frame {
    /// Allocate a blank frame
    pub fn new(rect: IntRect, format: PixelFormat, palette_depth: u8) -> Result<Self> {
        if rect.x < 0 || rect.y < 0 {
            return Err(ImageError::invalid("frame offset is negative"));
        }
        let alloc_err = ImageError::AllocationFailure {
            width: rect.width.max(0) as u32,
            height: rect.height.max(0) as u32,
        };
        if !allowed_size(rect.width, rect.height) {
            return Err(alloc_err);
        }

        let buffer = match format {
            PixelFormat::Paletted => {
                if palette_depth == 0 || palette_depth > 8 {
                    return Err(ImageError::invalid("palette depth must be 1..=8"));
                }
                let len = rect.width as usize * rect.height as usize;
                let mut indices = Vec::new();
                indices.try_reserve_exact(len).map_err(|_| alloc_err.clone())?;
                indices.resize(len, 0);
                FrameBuffer::Paletted {
                    indices,
                    palette: vec![[0; 4]; 1 << palette_depth],
                }
            }
            PixelFormat::Rgba | PixelFormat::Rgbx => {
                let pixmap = Pixmap::new(rect.width as u32, rect.height as u32).ok_or(alloc_err)?;
                FrameBuffer::Pixels(Arc::new(pixmap))
            }
        };

        Ok(Self {
            rect,
            format,
            palette_depth: if format == PixelFormat::Paletted { palette_depth } else { 0 },
            buffer,
            disposal: DisposalMethod::Keep,
            blend: BlendMethod::Over,
            timeout: 100,
            has_alpha: format != PixelFormat::Rgbx,
            compositing_failed: false,
            lock_count: 0,
        })
    }

    /// Wrap an existing pixmap as a full frame at `rect`
    pub(crate) fn from_pixmap(rect: IntRect, pixmap: Pixmap) -> Self {
        Self {
            rect,
            format: PixelFormat::Rgba,
            palette_depth: 0,
            buffer: FrameBuffer::Pixels(Arc::new(pixmap)),
            disposal: DisposalMethod::Keep,
            blend: BlendMethod::Over,
            timeout: 100,
            has_alpha: true,
            compositing_failed: false,
            lock_count: 0,
        }
    }

    pub fn rect(&self) -> IntRect {
        self.rect
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn palette_depth(&self) -> u8 {
        self.palette_depth
    }

    pub fn is_paletted(&self) -> bool {
        self.format == PixelFormat::Paletted
    }

    pub fn disposal(&self) -> DisposalMethod {
        self.disposal
    }

    pub fn set_disposal(&mut self, disposal: DisposalMethod) {
        self.disposal = disposal;
    }

    pub fn blend(&self) -> BlendMethod {
        self.blend
    }

    pub fn set_blend(&mut self, blend: BlendMethod) {
        self.blend = blend;
    }

    /// Raw duration as reported by the decoder
    pub fn raw_timeout(&self) -> i32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: i32) {
        self.timeout = timeout;
    }

    /// Duration used for playback; near-zero delays play at 100ms
    pub fn timeout(&self) -> i32 {
        if (0..=10).contains(&self.timeout) {
            100
        } else {
            self.timeout
        }
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    pub fn set_has_alpha(&mut self, has_alpha: bool) {
        self.has_alpha = has_alpha;
    }

    pub fn compositing_failed(&self) -> bool {
        self.compositing_failed
    }

    pub fn set_compositing_failed(&mut self, failed: bool) {
        self.compositing_failed = failed;
    }

    pub fn lock_data(&mut self) {
        self.lock_count += 1;
    }

    pub fn unlock_data(&mut self) {
        self.lock_count = self.lock_count.saturating_sub(1);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub(crate) fn geometry_matches(&self, rect: IntRect, format: PixelFormat, palette_depth: u8) -> bool {
        self.rect == rect
            && self.format == format
            && (format != PixelFormat::Paletted || self.palette_depth == palette_depth)
    }

    /// Pixel data, or palette indices for paletted frames
    pub fn data(&self) -> &[u8] {
        match &self.buffer {
            FrameBuffer::Pixels(pixmap) => pixmap.data(),
            FrameBuffer::Paletted { indices, .. } => indices,
        }
    }

    /// Mutable pixel data for decoders
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.buffer {
            FrameBuffer::Pixels(pixmap) => Arc::make_mut(pixmap).data_mut(),
            FrameBuffer::Paletted { indices, .. } => indices,
        }
    }

    pub fn palette(&self) -> &[[u8; 4]] {
        match &self.buffer {
            FrameBuffer::Paletted { palette, .. } => palette,
            FrameBuffer::Pixels(_) => &[],
        }
    }

    pub fn palette_mut(&mut self) -> Option<&mut [[u8; 4]]> {
        match &mut self.buffer {
            FrameBuffer::Paletted { palette, .. } => Some(palette),
            FrameBuffer::Pixels(_) => None,
        }
    }

    /// Shared handle to the pixel buffer; none for paletted frames
    pub fn pixmap(&self) -> Option<Arc<Pixmap>> {
        match &self.buffer {
            FrameBuffer::Pixels(pixmap) => Some(pixmap.clone()),
            FrameBuffer::Paletted { .. } => None,
        }
    }

    pub(crate) fn pixmap_ref(&self) -> Option<&Pixmap> {
        match &self.buffer {
            FrameBuffer::Pixels(pixmap) => Some(pixmap),
            FrameBuffer::Paletted { .. } => None,
        }
    }

    pub(crate) fn pixmap_mut(&mut self) -> Option<&mut Pixmap> {
        match &mut self.buffer {
            FrameBuffer::Pixels(pixmap) => Some(Arc::make_mut(pixmap)),
            FrameBuffer::Paletted { .. } => None,
        }
    }

    /// Palette color of an index; out-of-range indices are transparent
    pub(crate) fn palette_color(&self, index: u8) -> [u8; 4] {
        self.palette().get(index as usize).copied().unwrap_or([0; 4])
    }

    /// Expand into a premultiplied RGBA pixmap of the frame's own size
    pub fn to_pixmap(&self) -> Option<Pixmap> {
        match &self.buffer {
            FrameBuffer::Pixels(pixmap) => Some((**pixmap).clone()),
            FrameBuffer::Paletted { indices, .. } => {
                let mut data = Vec::with_capacity(indices.len() * 4);
                for &index in indices {
                    data.extend_from_slice(&self.palette_color(index));
                }
                let size = IntSize::from_wh(self.rect.width as u32, self.rect.height as u32)?;
                Pixmap::from_vec(data, size)
            }
        }
    }

    /// Mark the frame opaque if no pixel carries alpha
    pub fn optimize(&mut self) {
        if !self.has_alpha || self.is_paletted() {
            return;
        }
        let opaque = self.data().chunks_exact(4).all(|px| px[3] == 255);
        if opaque {
            self.has_alpha = false;
        }
    }

    /// Heap bytes held by this frame
    pub fn size_bytes(&self) -> usize {
        match &self.buffer {
            FrameBuffer::Pixels(pixmap) => pixmap.data().len(),
            FrameBuffer::Paletted { indices, palette } => indices.len() + palette.len() * 4,
        }
    }
}

fn allowed_size(width: i32, height: i32) -> bool {
    if width <= 0 || height <= 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return false;
    }
    (width as i64) * (height as i64) * 4 <= i32::MAX as i64
}

/// Ordered frames of one image
#[derive(Debug, Default)]
pub struct FrameStore {
    frames: Vec<Frame>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Insert a freshly allocated frame, write-locked
    ///
    /// The previous last frame is unlocked first so only the newest frame
    /// is ever held for writing.
    pub fn insert_frame(
        &mut self,
        index: usize,
        rect: IntRect,
        format: PixelFormat,
        palette_depth: u8,
    ) -> Result<&mut Frame> {
        if index > self.frames.len() {
            return Err(ImageError::invalid(format!(
                "frame index {} beyond {} frames",
                index,
                self.frames.len()
            )));
        }
        let mut frame = Frame::new(rect, format, palette_depth)?;

        if let Some(last) = self.frames.last_mut() {
            last.unlock_data();
        }
        frame.lock_data();
        self.frames.insert(index, frame);
        Ok(&mut self.frames[index])
    }

    /// Reuse the frame at `index` when its geometry matches, otherwise replace it
    ///
    /// Returns the frame and whether it was reused.
    pub fn ensure_frame(
        &mut self,
        index: usize,
        rect: IntRect,
        format: PixelFormat,
        palette_depth: u8,
    ) -> Result<(&mut Frame, bool)> {
        if index >= self.frames.len() {
            return self.insert_frame(index, rect, format, palette_depth).map(|f| (f, false));
        }
        if self.frames[index].geometry_matches(rect, format, palette_depth) {
            return Ok((&mut self.frames[index], true));
        }
        self.frames.remove(index);
        self.insert_frame(index, rect, format, palette_depth).map(|f| (f, false))
    }

    /// Drop every frame buffer
    pub fn delete_all(&mut self) {
        self.frames.clear();
    }

    pub fn lock_last(&mut self) {
        if let Some(last) = self.frames.last_mut() {
            last.lock_data();
        }
    }

    pub fn unlock_last(&mut self) {
        if let Some(last) = self.frames.last_mut() {
            last.unlock_data();
        }
    }

    /// Heap bytes held by all frames
    pub fn size_bytes(&self) -> usize {
        self.frames.iter().map(Frame::size_bytes).sum()
    }
}
