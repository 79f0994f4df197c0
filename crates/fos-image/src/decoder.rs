//! Decoder Contract
//!
//! Format decoders are driven through [`Decoder`] and report results
//! through a [`DecoderSink`] bound to the image being decoded.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{ImageError, Result};
use crate::frame::{BlendMethod, DisposalMethod, Frame, PixelFormat};
use crate::geom::{IntRect, Size};
use crate::raster::ImageState;

/// Options that change the decoded pixel values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DecodeFlags {
    /// Keep straight (non-premultiplied) alpha
    pub no_premultiply_alpha: bool,
    /// Skip embedded color profiles
    pub no_colorspace_conversion: bool,
}

/// Incremental format decoder
///
/// `write` must accept any chunking of the input. Failures are recorded
/// by the decoder and reported through [`Decoder::error`].
pub trait Decoder {
    /// Only parse far enough to learn the intrinsic size
    fn set_size_decode(&mut self, size_decode: bool);

    fn is_size_decode(&self) -> bool;

    fn set_decode_flags(&mut self, flags: DecodeFlags);

    fn decode_flags(&self) -> DecodeFlags;

    fn init(&mut self, _sink: &mut DecoderSink<'_>) {}

    fn write(&mut self, data: &[u8], sink: &mut DecoderSink<'_>);

    /// Flush remaining state; must be idempotent
    fn finish(&mut self, sink: &mut DecoderSink<'_>);

    /// The decode is being abandoned; a following `finish` need not produce frames
    fn interrupt(&mut self) {}

    fn error(&self) -> Option<ImageError>;

    /// Frames that are safe to display while decoding continues
    fn complete_frame_count(&self) -> usize;
}

/// Callbacks a decoder uses to fill its image
pub struct DecoderSink<'a> {
    image: &'a mut ImageState,
}

impl<'a> DecoderSink<'a> {
    pub(crate) fn new(image: &'a mut ImageState) -> Self {
        Self { image }
    }

    /// Intrinsic size, if already known
    pub fn size(&self) -> Option<Size> {
        self.image.size()
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.image.set_size(width, height)
    }

    /// Get a writable frame at `index`, allocating or replacing it as needed
    pub fn ensure_frame(
        &mut self,
        index: usize,
        rect: IntRect,
        format: PixelFormat,
        palette_depth: u8,
    ) -> Result<&mut Frame> {
        self.image.ensure_frame(index, rect, format, palette_depth)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.image.frames_mut().get_mut(index)
    }

    pub fn frame_count(&self) -> usize {
        self.image.frame_count()
    }

    /// Pixels of frame `index` inside `rect` were written
    pub fn frame_updated(&mut self, index: usize, rect: IntRect) {
        self.image.frame_updated(index, rect);
    }

    pub fn set_frame_disposal(&mut self, index: usize, disposal: DisposalMethod) -> Result<()> {
        self.frame_or_invalid(index)?.set_disposal(disposal);
        Ok(())
    }

    pub fn set_frame_blend(&mut self, index: usize, blend: BlendMethod) -> Result<()> {
        self.frame_or_invalid(index)?.set_blend(blend);
        Ok(())
    }

    pub fn set_frame_timeout(&mut self, index: usize, timeout: i32) -> Result<()> {
        self.frame_or_invalid(index)?.set_timeout(timeout);
        Ok(())
    }

    pub fn set_frame_has_no_alpha(&mut self, index: usize) -> Result<()> {
        self.frame_or_invalid(index)?.set_has_alpha(false);
        Ok(())
    }

    /// -1 loops forever, 0 plays once
    pub fn set_loop_count(&mut self, count: i32) {
        self.image.set_loop_count(count);
    }

    pub fn frame_complete(&mut self, index: usize) {
        self.image.frame_complete(index);
    }

    /// Every frame has been decoded
    pub fn decoding_complete(&mut self) -> Result<()> {
        self.image.decoding_complete()
    }

    fn frame_or_invalid(&mut self, index: usize) -> Result<&mut Frame> {
        self.image
            .frames_mut()
            .get_mut(index)
            .ok_or_else(|| ImageError::invalid(format!("no frame {}", index)))
    }
}

/// Creates decoders on demand
pub type DecoderFactory = Rc<dyn Fn() -> Box<dyn Decoder>>;

/// Mime type to decoder factory table
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl DecoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with decoders for the common web formats
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::codec::register_builtin(&mut registry);
        registry
    }

    pub fn register(&mut self, mime: &str, factory: impl Fn() -> Box<dyn Decoder> + 'static) {
        self.factories.insert(mime.to_ascii_lowercase(), Rc::new(factory));
    }

    pub fn supports(&self, mime: &str) -> bool {
        self.factories.contains_key(&mime.to_ascii_lowercase())
    }

    pub fn create(&self, mime: &str) -> Option<Box<dyn Decoder>> {
        self.factories.get(&mime.to_ascii_lowercase()).map(|factory| factory())
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mimes: Vec<_> = self.factories.keys().collect();
        mimes.sort();
        f.debug_struct("DecoderRegistry").field("mimes", &mimes).finish()
    }
}
