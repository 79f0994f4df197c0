//! Raster Images
//!
//! [`RasterImage`] sequences the frame store, the decoder, the decode
//! scheduler, the discard tracker, the compositor and the downscaler for a
//! single image.
//!
//! All state sits behind a `RefCell` on the owner thread. Events raised
//! while the state is borrowed are queued and handed to the observer once
//! the borrow is released, so observers may call back into the image.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use tiny_skia::Pixmap;

use crate::ImageId;
use crate::animation::{self, AnimationMode, AnimationState, Playback};
use crate::decoder::{DecodeFlags, Decoder, DecoderSink};
use crate::discard::DiscardTarget;
use crate::downscale::{ScaleLookup, ScaleTarget};
use crate::error::{ImageError, Result};
use crate::frame::{DisposalMethod, Frame, FrameStore, PixelFormat};
use crate::geom::{IntRect, Size};
use crate::observer::{ImageEvent, ImageObserver};
use crate::scheduler::DecodeTarget;
use crate::services::ImageServices;

/// Flags fixed at [`RasterImage::init`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitFlags {
    /// Decoded frames may be dropped and redecoded from the kept source
    pub discardable: bool,
    /// Only learn the size until someone draws the image
    pub decode_on_draw: bool,
    /// Source arrives as a sequence of replacement images
    pub multipart: bool,
}

/// Frame selector for [`RasterImage::get_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichFrame {
    First,
    Current,
}

/// Per-call frame options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Decode everything buffered before returning
    pub sync_decode: bool,
    pub decode: DecodeFlags,
}

/// Sampling quality hint of a draw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Filter {
    #[default]
    Nearest,
    Good,
}

/// Parameters of a draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawParams {
    pub filter: Filter,
    /// Image to device scale factors
    pub scale: (f32, f32),
    pub flags: FrameFlags,
}

impl Default for DrawParams {
    fn default() -> Self {
        Self {
            filter: Filter::Nearest,
            scale: (1.0, 1.0),
            flags: FrameFlags::default(),
        }
    }
}

/// Pixels handed to the painter
#[derive(Debug, Clone)]
pub struct DrawnFrame {
    pub pixmap: Arc<Pixmap>,
    /// Position of the frame on the canvas, in image space
    pub rect: IntRect,
    /// Set when `pixmap` was already downscaled by these factors
    pub prescaled: Option<(f32, f32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownIntent {
    Done,
    Interrupted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeType {
    Normal,
    UntilSize,
}

struct PendingEvent {
    event: ImageEvent,
    /// Raised from inside a decoder call
    from_decoder: bool,
}

/// Mutable state of one image
pub(crate) struct ImageState {
    id: ImageId,
    services: ImageServices,
    me: Weak<ImageCell>,
    /// Shared with the cell so observers see it while nothing is borrowed
    in_decoder: Rc<Cell<bool>>,

    initialized: bool,
    mime: String,
    flags: InitFlags,
    size: Option<Size>,

    source: Vec<u8>,
    bytes_decoded: usize,
    has_source_data: bool,

    decoder: Option<Box<dyn Decoder>>,
    /// Inside `shutdown_decoder`
    finishing: bool,
    decoded: bool,
    has_been_decoded: bool,
    decode_count: u32,
    frame_decode_flags: DecodeFlags,

    frames: FrameStore,
    /// Frame 0 of the current frames carries the scale job's lock
    scale_lock_held: bool,
    anim: Option<AnimationState>,
    playback: Playback,

    lock_count: u32,
    error: bool,
    last_error: Option<ImageError>,

    /// Decoded area not yet reported
    invalid_rect: Option<IntRect>,
    events: Vec<PendingEvent>,
}

impl ImageState {
    fn new(id: ImageId, services: ImageServices, me: Weak<ImageCell>, in_decoder: Rc<Cell<bool>>) -> Self {
        Self {
            id,
            services,
            me,
            in_decoder,
            initialized: false,
            mime: String::new(),
            flags: InitFlags::default(),
            size: None,
            source: Vec::new(),
            bytes_decoded: 0,
            has_source_data: false,
            decoder: None,
            finishing: false,
            decoded: false,
            has_been_decoded: false,
            decode_count: 0,
            frame_decode_flags: DecodeFlags::default(),
            frames: FrameStore::new(),
            scale_lock_held: false,
            anim: None,
            playback: Playback::default(),
            lock_count: 0,
            error: false,
            last_error: None,
            invalid_rect: None,
            events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Decoder callbacks
    // ------------------------------------------------------------------

    pub(crate) fn size(&self) -> Option<Size> {
        self.size
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.check_error()?;
        let size = Size::new(width, height);
        if let Some(old) = self.size {
            if old == size {
                return Ok(());
            }
            if !self.flags.multipart {
                let e = ImageError::SizeMismatch {
                    old_width: old.width,
                    old_height: old.height,
                    new_width: width,
                    new_height: height,
                };
                self.do_error(e.clone());
                return Err(e);
            }
        }
        self.size = Some(size);
        self.emit(ImageEvent::SizeAvailable { width, height });
        Ok(())
    }

    pub(crate) fn ensure_frame(
        &mut self,
        index: usize,
        rect: IntRect,
        format: PixelFormat,
        palette_depth: u8,
    ) -> Result<&mut Frame> {
        self.check_error()?;
        let ensured = self.frames.ensure_frame(index, rect, format, palette_depth).map(|(_, reused)| reused);
        let reused = match ensured {
            Ok(reused) => reused,
            Err(e) => {
                if e.is_sticky() {
                    self.do_error(e.clone());
                }
                return Err(e);
            }
        };

        if !reused && index == 0 {
            self.scale_lock_held = false;
        }
        if !reused && index > 0 {
            self.ensure_anim_exists();
            let first_area = if index == 1 {
                self.frames
                    .get(0)
                    .filter(|first| {
                        matches!(first.disposal(), DisposalMethod::Clear | DisposalMethod::RestorePrevious)
                    })
                    .map(Frame::rect)
            } else {
                None
            };
            if let Some(anim) = self.anim.as_mut() {
                if let Some(area) = first_area {
                    anim.first_frame_refresh_area = area;
                }
                anim.grow_refresh_area(rect);
            }
            self.evaluate_animation();
        }

        self.frames.get_mut(index).ok_or(ImageError::NotAvailable)
    }

    pub(crate) fn frames_mut(&mut self) -> &mut FrameStore {
        &mut self.frames
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn frame_updated(&mut self, index: usize, rect: IntRect) {
        if index != self.current_frame_index() {
            return;
        }
        self.invalid_rect = Some(match self.invalid_rect {
            Some(pending) => pending.union(&rect),
            None => rect,
        });
    }

    pub(crate) fn set_loop_count(&mut self, count: i32) {
        self.playback.loop_count = count;
    }

    pub(crate) fn frame_complete(&mut self, index: usize) {
        self.flush_invalidations();
        self.emit(ImageEvent::FrameComplete(index));
        if index > 0 {
            self.evaluate_animation();
        }
    }

    pub(crate) fn decoding_complete(&mut self) -> Result<()> {
        self.check_error()?;
        self.decoded = true;
        self.has_been_decoded = true;

        if self.can_discard() {
            self.touch_discard_tracker();
        }
        // Multipart images reuse their single frame for the next part
        if self.frames.len() == 1 && !self.flags.multipart {
            if let Some(frame) = self.frames.get_mut(0) {
                frame.optimize();
            }
        }

        self.flush_invalidations();
        self.emit(ImageEvent::DecodeComplete);
        tracing::debug!("image {} decoded ({} frames)", self.id, self.frames.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn init(&mut self, mime: &str, flags: InitFlags) -> Result<()> {
        if self.initialized {
            return Err(ImageError::AlreadyInitialized);
        }
        self.check_error()?;
        if flags.multipart && (flags.discardable || flags.decode_on_draw) {
            return Err(ImageError::invalid("multipart images cannot be discardable or decode on draw"));
        }

        self.mime = mime.to_string();
        self.flags = flags;
        self.init_decoder(flags.decode_on_draw)?;
        self.initialized = true;
        tracing::debug!("image {} initialized as {} ({:?})", self.id, self.mime, flags);
        Ok(())
    }

    fn add_source_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_error()?;
        if !self.initialized {
            return Err(ImageError::invalid("image is not initialized"));
        }
        if self.in_decoder.get() {
            return Err(ImageError::Reentrant);
        }
        if self.has_source_data {
            return Err(ImageError::invalid("source data is already complete"));
        }
        if data.is_empty() || self.decoded {
            return Ok(());
        }

        // Start of a new part
        if self.flags.multipart && self.bytes_decoded == 0 {
            self.drop_animation();
            if self.frames.len() > 1 {
                self.delete_frames();
            }
        }

        if !self.storing_source_data() {
            self.write_to_decoder(data)?;
            if !self.decoded {
                self.flush_invalidations();
            }
        } else {
            if self.source.try_reserve(data.len()).is_err() {
                let e = ImageError::AllocationFailure {
                    width: self.size.map_or(0, |s| s.width),
                    height: self.size.map_or(0, |s| s.height),
                };
                self.do_error(e.clone());
                return Err(e);
            }
            self.source.extend_from_slice(data);
            if self.decoder.is_some() {
                self.services.scheduler().request_decode(self.id, &self.decode_target());
            }
        }

        tracing::trace!("image {} received {} bytes", self.id, data.len());
        Ok(())
    }

    fn source_data_complete(&mut self) -> Result<()> {
        self.check_error()?;
        if self.has_source_data {
            return Ok(());
        }
        self.has_source_data = true;

        if !self.storing_source_data() {
            self.shutdown_decoder(ShutdownIntent::Done)?;
        }

        // Learn the size now, leave the rest to the scheduler
        if self.decoder.is_some() {
            let scheduler = self.services.scheduler().clone();
            self.decode_some_of_image(DecodeType::UntilSize, scheduler.max_bytes_per_chunk(), scheduler.deadline_from_now())?;
        }
        if self.decoder.is_some() {
            self.services.scheduler().request_decode(self.id, &self.decode_target());
        }

        self.source.shrink_to_fit();
        if self.can_discard() {
            self.touch_discard_tracker();
        }
        tracing::debug!("image {} has all {} source bytes", self.id, self.source.len());
        Ok(())
    }

    fn new_source_data(&mut self) -> Result<()> {
        self.check_error()?;
        if !self.flags.multipart {
            return Err(ImageError::invalid("only multipart images take new parts"));
        }
        if !self.has_source_data {
            return Err(ImageError::invalid("previous part is still arriving"));
        }
        if self.decoder.is_some() {
            self.shutdown_decoder(ShutdownIntent::Interrupted)?;
        }

        self.stop_scale();
        self.decoded = false;
        self.has_source_data = false;
        self.source.clear();
        self.init_decoder(false)
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    fn storing_source_data(&self) -> bool {
        self.flags.decode_on_draw || self.flags.discardable
    }

    fn init_decoder(&mut self, size_decode: bool) -> Result<()> {
        if self.decoder.is_some() {
            return Err(ImageError::invalid("a decoder is already running"));
        }
        let Some(mut decoder) = self.services.decoders().create(&self.mime) else {
            let e = ImageError::NoDecoder(self.mime.clone());
            self.do_error(e.clone());
            return Err(e);
        };

        decoder.set_size_decode(size_decode);
        decoder.set_decode_flags(self.frame_decode_flags);
        let was_in_decoder = self.in_decoder.replace(true);
        decoder.init(&mut DecoderSink::new(self));
        self.in_decoder.set(was_in_decoder);

        if let Some(e) = decoder.error() {
            self.do_error(e.clone());
            return Err(e);
        }
        self.decoder = Some(decoder);
        if !size_decode {
            self.decode_count += 1;
        }
        tracing::debug!(
            "image {} started {} decoder for {}",
            self.id,
            if size_decode { "size" } else { "full" },
            self.mime
        );
        Ok(())
    }

    fn write_to_decoder(&mut self, data: &[u8]) -> Result<()> {
        let Some(mut decoder) = self.decoder.take() else {
            return Err(ImageError::NotAvailable);
        };

        self.frames.lock_last();
        let was_in_decoder = self.in_decoder.replace(true);
        decoder.write(data, &mut DecoderSink::new(self));
        self.in_decoder.set(was_in_decoder);
        self.frames.unlock_last();

        let failure = decoder.error();
        self.decoder = Some(decoder);
        self.bytes_decoded += data.len();

        if let Some(e) = failure {
            self.do_error(e.clone());
            // The error may have been raised before the decoder was put back
            let _ = self.shutdown_decoder(ShutdownIntent::Error);
            return Err(e);
        }
        if self.error {
            // A callback failed without the decoder noticing
            let _ = self.shutdown_decoder(ShutdownIntent::Error);
            return Err(self.failure());
        }
        Ok(())
    }

    /// Write the next chunk of buffered source
    fn decode_some_data(&mut self, max_bytes: usize) -> Result<()> {
        if self.decoder.is_none() {
            return Err(ImageError::NotAvailable);
        }
        if self.bytes_decoded >= self.source.len() {
            return Ok(());
        }

        let start = self.bytes_decoded;
        let end = start.saturating_add(max_bytes).min(self.source.len());
        let source = std::mem::take(&mut self.source);
        let result = self.write_to_decoder(&source[start..end]);
        self.source = source;
        result
    }

    fn is_decode_finished(&self) -> bool {
        let Some(decoder) = &self.decoder else {
            return true;
        };
        if decoder.is_size_decode() {
            if self.size.is_some() {
                return true;
            }
        } else if self.decoded {
            return true;
        }
        self.has_source_data && self.bytes_decoded == self.source.len()
    }

    /// Buffered bytes remain for the live decoder
    fn wants_more_decoding(&self) -> bool {
        self.decoder.is_some()
            && !self.error
            && !self.is_decode_finished()
            && self.source.len() > self.bytes_decoded
    }

    fn decode_some_of_image(&mut self, kind: DecodeType, max_bytes: usize, deadline: Instant) -> Result<()> {
        if self.error {
            return Ok(());
        }
        let size_decode = match &self.decoder {
            Some(decoder) if !self.decoded => decoder.is_size_decode(),
            _ => return Ok(()),
        };
        let max_bytes = if size_decode { self.source.len() } else { max_bytes };

        let start = Instant::now();
        while self.source.len() > self.bytes_decoded
            && !self.is_decode_finished()
            && !(kind == DecodeType::UntilSize && self.size.is_some())
        {
            self.decode_some_data(max_bytes)?;
            // Checked after the chunk so every slice makes progress
            if Instant::now() >= deadline {
                break;
            }
        }
        self.services.scheduler().record_decode_time(self.id, start.elapsed());

        if kind != DecodeType::UntilSize && !self.has_source_data {
            self.flush_invalidations();
        }
        if self.decoder.is_some() && self.is_decode_finished() {
            self.shutdown_decoder(ShutdownIntent::Done)?;
        }
        Ok(())
    }

    fn shutdown_decoder(&mut self, intent: ShutdownIntent) -> Result<()> {
        let Some(mut decoder) = self.decoder.take() else {
            return Ok(());
        };
        let size_decode = decoder.is_size_decode();

        if intent == ShutdownIntent::Interrupted {
            decoder.interrupt();
        }
        self.finishing = true;
        self.frames.lock_last();
        let was_in_decoder = self.in_decoder.replace(true);
        decoder.finish(&mut DecoderSink::new(self));
        self.in_decoder.set(was_in_decoder);
        self.frames.unlock_last();
        self.finishing = false;

        self.services.scheduler().stop_decoding(self.id);
        self.bytes_decoded = 0;
        self.flush_invalidations();
        tracing::debug!("image {} decoder shut down ({:?})", self.id, intent);

        if let Some(e) = decoder.error() {
            // Input cut short on purpose is not a broken image
            if intent == ShutdownIntent::Interrupted {
                tracing::debug!("image {} ignoring error from interrupted decoder: {}", self.id, e);
            } else {
                self.do_error(e.clone());
                return Err(e);
            }
        }
        drop(decoder);
        if self.error {
            return Err(self.failure());
        }

        if intent == ShutdownIntent::Done {
            let failed = if size_decode { self.size.is_none() } else { !self.decoded };
            if failed {
                self.do_error(ImageError::UnexpectedEof);
                return Err(ImageError::UnexpectedEof);
            }
        }
        Ok(())
    }

    fn request_decode(&mut self) -> Result<()> {
        self.check_error()?;
        if self.decoded || !self.storing_source_data() {
            return Ok(());
        }
        if self.decoder.as_ref().is_some_and(|decoder| !decoder.is_size_decode()) {
            return Ok(());
        }
        // Called back from shutdown_decoder; the decode is already over
        if self.finishing {
            return Ok(());
        }
        if self.in_decoder.get() {
            self.defer_request_decode();
            return Ok(());
        }

        let flags = self.frame_decode_flags;
        if self
            .decoder
            .as_ref()
            .is_some_and(|decoder| decoder.is_size_decode() || decoder.decode_flags() != flags)
        {
            self.shutdown_decoder(ShutdownIntent::Interrupted)?;
        }
        if self.decoder.is_none() {
            self.init_decoder(false)?;
        }
        if self.bytes_decoded == self.source.len() {
            return Ok(());
        }

        let scheduler = self.services.scheduler().clone();
        if self.has_source_data {
            // Small images finish right here
            self.decode_some_of_image(DecodeType::Normal, scheduler.max_bytes_per_chunk(), scheduler.deadline_from_now())?;
            if self.wants_more_decoding() {
                scheduler.request_decode(self.id, &self.decode_target());
            }
            return Ok(());
        }
        scheduler.request_decode(self.id, &self.decode_target());
        Ok(())
    }

    fn defer_request_decode(&self) {
        let me = self.me.clone();
        self.services.host().post(move || {
            if let Some(cell) = me.upgrade() {
                if let Err(e) = cell.with_state(ImageState::request_decode) {
                    tracing::debug!("deferred decode request of image {} failed: {}", cell.id, e);
                }
            }
        });
    }

    fn sync_decode(&mut self) -> Result<()> {
        self.check_error()?;
        if self.in_decoder.get() {
            return Err(ImageError::Reentrant);
        }
        if self.decoded || !self.storing_source_data() {
            return Ok(());
        }

        let flags = self.frame_decode_flags;
        if self
            .decoder
            .as_ref()
            .is_some_and(|decoder| decoder.is_size_decode() || decoder.decode_flags() != flags)
        {
            self.shutdown_decoder(ShutdownIntent::Interrupted)?;
        }
        if self.decoder.is_none() {
            self.init_decoder(false)?;
        }

        self.decode_some_data(usize::MAX)?;
        self.flush_invalidations();

        if self.decoder.is_some() && self.is_decode_finished() {
            self.shutdown_decoder(ShutdownIntent::Done)?;
        }
        if self.error {
            return Err(self.failure());
        }
        Ok(())
    }

    /// Switch decode flags, redecoding if frames already exist
    fn apply_decode_flags(&mut self, flags: DecodeFlags) -> Result<()> {
        if flags == self.frame_decode_flags {
            return Ok(());
        }
        if self.frames.is_empty() && !self.decoded {
            self.frame_decode_flags = flags;
            return Ok(());
        }
        if !self.can_forcibly_discard() || self.anim.is_some() {
            return Err(ImageError::invalid("decode flags of these frames cannot change"));
        }
        self.discard(true);
        self.frame_decode_flags = flags;
        Ok(())
    }

    fn want_decoded_frames(&mut self) -> Result<()> {
        if self.can_discard() {
            self.touch_discard_tracker();
        }
        if self.storing_source_data() {
            self.request_decode()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Errors and events
    // ------------------------------------------------------------------

    fn check_error(&self) -> Result<()> {
        if self.error {
            return Err(ImageError::Failed);
        }
        Ok(())
    }

    fn failure(&self) -> ImageError {
        self.last_error.clone().unwrap_or(ImageError::Failed)
    }

    fn do_error(&mut self, error: ImageError) {
        if self.error {
            return;
        }
        if self.decoder.is_some() {
            let _ = self.shutdown_decoder(ShutdownIntent::Error);
            // The decoder may have reported its own error
            if self.error {
                return;
            }
        }

        self.error = true;
        self.stop_scale();
        self.services.discard_tracker().remove(self.id);
        tracing::warn!("image {} failed: {}", self.id, error);
        self.last_error = Some(error);
        self.emit(ImageEvent::Error);
    }

    fn emit(&mut self, event: ImageEvent) {
        self.events.push(PendingEvent {
            event,
            from_decoder: self.in_decoder.get(),
        });
    }

    fn flush_invalidations(&mut self) {
        let Some(rect) = self.invalid_rect.take() else {
            return;
        };
        if !rect.is_empty() {
            self.emit(ImageEvent::FrameChanged(rect));
        }
    }

    // ------------------------------------------------------------------
    // Locking and discarding
    // ------------------------------------------------------------------

    fn decode_target(&self) -> Weak<dyn DecodeTarget> {
        self.me.clone()
    }

    fn discard_target(&self) -> Weak<dyn DiscardTarget> {
        self.me.clone()
    }

    fn scale_target(&self) -> Weak<dyn ScaleTarget> {
        self.me.clone()
    }

    fn touch_discard_tracker(&self) {
        self.services.discard_tracker().reset(self.id, &self.discard_target());
    }

    fn can_discard(&self) -> bool {
        self.services.discard_tracker().enabled()
            && self.flags.discardable
            && self.lock_count == 0
            && self.has_source_data
            && self.decoded
    }

    fn can_forcibly_discard(&self) -> bool {
        self.flags.discardable && self.has_source_data
    }

    fn lock(&mut self) -> Result<()> {
        self.check_error()?;
        self.services.discard_tracker().remove(self.id);
        self.lock_count += 1;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.check_error()?;
        if self.lock_count == 0 {
            return Err(ImageError::NotLocked);
        }
        self.lock_count -= 1;
        if self.lock_count == 0 {
            self.stop_scale();
        }

        // Nobody needs the redecode in flight any more
        if self.has_been_decoded && self.decoder.is_some() && self.lock_count == 0 && self.can_forcibly_discard() {
            tracing::debug!("image {} unlocked mid-decode, discarding", self.id);
            self.shutdown_decoder(ShutdownIntent::Interrupted)?;
            self.discard(true);
            return Ok(());
        }

        if self.can_discard() {
            self.touch_discard_tracker();
        }
        Ok(())
    }

    fn request_discard(&mut self) -> Result<()> {
        self.check_error()?;
        if self.can_discard() {
            self.discard(true);
        }
        Ok(())
    }

    fn discard_now(&mut self) -> Result<()> {
        self.check_error()?;
        if self.anim.is_some() {
            return Err(ImageError::invalid("animated images are never discarded"));
        }
        if !self.can_forcibly_discard() {
            return Err(ImageError::invalid("image keeps no source to redecode from"));
        }
        self.discard(true);
        Ok(())
    }

    fn discard_expired(&mut self) {
        if self.can_discard() && self.decoder.is_none() && self.anim.is_none() {
            self.discard(false);
        } else {
            tracing::debug!("image {} expired but is no longer discardable", self.id);
        }
    }

    fn discard(&mut self, force: bool) {
        if self.anim.is_some() {
            return;
        }
        if force && self.decoder.is_some() {
            let _ = self.shutdown_decoder(ShutdownIntent::Interrupted);
        }
        if self.decoder.is_some() {
            return;
        }

        self.stop_scale();
        let count = self.frames.len();
        self.delete_frames();
        self.decoded = false;
        self.invalid_rect = None;
        if force {
            self.services.discard_tracker().remove(self.id);
        }
        self.emit(ImageEvent::Discarded);
        tracing::debug!(
            "image {} discarded {} frames, keeping {} source bytes",
            self.id,
            count,
            self.source.len()
        );
    }

    // ------------------------------------------------------------------
    // Drawing
    // ------------------------------------------------------------------

    fn current_frame_index(&self) -> usize {
        self.anim.as_ref().map_or(0, AnimationState::current_index)
    }

    /// Frame `index` as it should be displayed, composited if needed
    fn frame_no_decode(&self, index: usize) -> Option<&Frame> {
        match &self.anim {
            Some(anim) if anim.last_composited_index() == Some(index) => anim.composite(),
            _ => self.frames.get(index),
        }
    }

    fn drawable_frame(&self, index: usize) -> Option<&Frame> {
        self.frame_no_decode(index).filter(|frame| !frame.compositing_failed())
    }

    fn can_scale(&self, filter: Filter, scale: (f32, f32)) -> bool {
        let config = self.services.config();
        if !config.hq_downscaling_enabled || filter != Filter::Good || self.anim.is_some() || !self.decoded {
            return false;
        }
        if scale.0 > 1.0 || scale.1 > 1.0 {
            return false;
        }
        let threshold = config.downscale_threshold();
        scale.0 < threshold || scale.1 < threshold
    }

    fn stop_scale(&mut self) {
        if self.services.scaler().stop(self.id) {
            self.release_scale_lock();
        }
    }

    /// Give back the lock a scale job took on frame 0
    ///
    /// A job that outlives the frames it was reading from has nothing to release.
    fn release_scale_lock(&mut self) {
        if !std::mem::take(&mut self.scale_lock_held) {
            return;
        }
        if let Some(frame) = self.frames.get_mut(0) {
            frame.unlock_data();
        }
    }

    fn delete_frames(&mut self) {
        self.frames.delete_all();
        self.scale_lock_held = false;
    }

    /// Ready downscaled pixels, queueing a job when there are none
    fn prescaled_frame(&mut self, params: &DrawParams) -> Option<Arc<Pixmap>> {
        if !self.can_scale(params.filter, params.scale) {
            return None;
        }
        let scaler = self.services.scaler().clone();
        match scaler.lookup(self.id, params.scale) {
            ScaleLookup::Ready(pixmap) => Some(pixmap),
            ScaleLookup::InFlight => None,
            ScaleLookup::Absent => {
                let frame = self.frames.get(0)?;
                let (src, rect) = (frame.pixmap()?, frame.rect());
                if scaler.request_scale(self.id, &self.scale_target(), src, rect, params.scale) {
                    if let Some(frame) = self.frames.get_mut(0) {
                        frame.lock_data();
                        self.scale_lock_held = true;
                    }
                }
                None
            }
        }
    }

    fn draw(&mut self, params: &DrawParams) -> Result<Option<DrawnFrame>> {
        self.check_error()?;
        if params.flags.sync_decode && self.in_decoder.get() {
            return Err(ImageError::Reentrant);
        }
        self.apply_decode_flags(params.flags.decode)?;

        if self.services.discard_tracker().contains(self.id) {
            self.touch_discard_tracker();
        }
        // Discarded images are redecoded ahead of the rest
        if !self.decoded && self.has_source_data {
            self.services.scheduler().mark_as_asap(self.id, &self.decode_target());
        }
        if params.flags.sync_decode {
            self.sync_decode()?;
        }

        let index = self.current_frame_index();
        self.want_decoded_frames()?;
        let prescaled = self.prescaled_frame(params);

        let Some(frame) = self.drawable_frame(index) else {
            return Ok(None);
        };
        let rect = frame.rect();
        if let Some(pixmap) = prescaled {
            return Ok(Some(DrawnFrame {
                pixmap,
                rect,
                prescaled: Some(params.scale),
            }));
        }
        let pixmap = match frame.pixmap() {
            Some(pixmap) => pixmap,
            None => Arc::new(frame.to_pixmap().ok_or(ImageError::NotAvailable)?),
        };
        Ok(Some(DrawnFrame {
            pixmap,
            rect,
            prescaled: None,
        }))
    }

    fn get_frame(&mut self, which: WhichFrame, flags: FrameFlags) -> Result<Arc<Pixmap>> {
        self.check_error()?;
        if flags.sync_decode && self.in_decoder.get() {
            return Err(ImageError::Reentrant);
        }
        self.apply_decode_flags(flags.decode)?;
        if flags.sync_decode {
            self.sync_decode()?;
        }

        let index = match which {
            WhichFrame::First => 0,
            WhichFrame::Current => self.current_frame_index(),
        };
        self.want_decoded_frames()?;

        let size = self.size.ok_or(ImageError::NotAvailable)?;
        let frame = self.drawable_frame(index).ok_or(ImageError::NotAvailable)?;
        if frame.rect() == size.to_rect() {
            if let Some(pixmap) = frame.pixmap() {
                return Ok(pixmap);
            }
        }

        // Pad partial or paletted frames out to the full image
        let mut canvas = Frame::new(size.to_rect(), PixelFormat::Rgba, 0)?;
        animation::draw_frame_to(frame, &mut canvas, frame.rect())?;
        canvas.pixmap().ok_or(ImageError::NotAvailable)
    }

    // ------------------------------------------------------------------
    // Animation
    // ------------------------------------------------------------------

    fn should_animate(&self) -> bool {
        self.playback.requested
            && self.playback.mode != AnimationMode::DontAnimate
            && self.frames.len() >= 2
            && !self.playback.finished
            && !self.error
    }

    fn ensure_anim_exists(&mut self) {
        if self.anim.is_some() {
            return;
        }
        self.anim = Some(AnimationState::new(Instant::now()));
        // Animated images are never discarded
        self.lock_count += 1;
        self.services.discard_tracker().remove(self.id);
        tracing::debug!("image {} is animated", self.id);
    }

    fn drop_animation(&mut self) {
        self.playback.animating = false;
        self.playback.finished = false;
        if self.anim.take().is_some() {
            self.lock_count = self.lock_count.saturating_sub(1);
        }
    }

    fn current_frame_end(&self) -> Option<Instant> {
        let anim = self.anim.as_ref()?;
        let frame = self.frames.get(anim.current_index())?;
        anim.current_frame_end(frame.timeout())
    }

    fn evaluate_animation(&mut self) {
        if !self.playback.animating && self.should_animate() {
            self.start_animation_now();
        } else if self.playback.animating && !self.should_animate() {
            self.playback.animating = false;
        }
    }

    fn start_animation_now(&mut self) {
        self.ensure_anim_exists();
        let timeout = self
            .anim
            .as_ref()
            .and_then(|anim| self.frames.get(anim.current_index()))
            .map(Frame::timeout);
        // A frame shown forever ends the animation on the spot
        if timeout.is_some_and(|timeout| timeout < 0) {
            self.playback.finished = true;
            return;
        }
        if let Some(anim) = self.anim.as_mut() {
            anim.current_frame_time = Instant::now();
        }
        self.playback.animating = true;
    }

    fn set_animation_mode(&mut self, mode: AnimationMode) -> Result<()> {
        self.check_error()?;
        self.playback.mode = mode;
        self.evaluate_animation();
        Ok(())
    }

    fn start_animation(&mut self) -> Result<()> {
        self.check_error()?;
        self.playback.requested = true;
        self.evaluate_animation();
        Ok(())
    }

    fn stop_animation(&mut self) -> Result<()> {
        self.check_error()?;
        self.playback.requested = false;
        self.playback.animating = false;
        Ok(())
    }

    fn reset_animation(&mut self) -> Result<()> {
        self.check_error()?;
        if self.playback.mode == AnimationMode::DontAnimate {
            return Ok(());
        }
        let Some(anim) = self.anim.as_mut() else {
            return Ok(());
        };
        if anim.current_index() == 0 {
            return Ok(());
        }

        anim.rewind();
        let refresh_area = anim.first_frame_refresh_area();
        self.playback.finished = false;
        let was_animating = std::mem::replace(&mut self.playback.animating, false);
        if was_animating {
            self.emit(ImageEvent::FrameChanged(refresh_area));
        }
        if self.should_animate() {
            self.start_animation_now();
        }
        Ok(())
    }

    fn advance_frame(&mut self, now: Instant) -> Option<IntRect> {
        let canvas = self.size?;
        let complete_frames = self.decoder.as_ref().map(|decoder| decoder.complete_frame_count());
        let anim = self.anim.as_mut()?;
        let dirty = animation::advance_frame(anim, &mut self.frames, canvas, &mut self.playback, complete_frames, now);
        if self.playback.finished {
            self.evaluate_animation();
        }
        dirty
    }

    fn request_refresh(&mut self, now: Instant) -> Result<()> {
        self.check_error()?;
        if !self.playback.animating || !self.should_animate() {
            return Ok(());
        }
        self.ensure_anim_exists();

        let mut end = self.current_frame_end();
        let mut advanced = false;
        let mut dirty = IntRect::default();
        while end.is_some_and(|end| end <= now) {
            let previous_end = end;
            let frame_dirty = self.advance_frame(now);
            end = self.current_frame_end();
            if let Some(rect) = frame_dirty {
                advanced = true;
                dirty = dirty.union(&rect);
            } else if end == previous_end {
                // Next frame is still downloading
                break;
            }
        }

        if advanced {
            self.emit(ImageEvent::FrameChanged(dirty));
        }
        Ok(())
    }
}

impl Drop for ImageState {
    fn drop(&mut self) {
        self.stop_scale();
        self.anim = None;
        self.delete_frames();
        self.services.discard_tracker().remove(self.id);
        if self.decoder.is_some() {
            let _ = self.shutdown_decoder(ShutdownIntent::Interrupted);
        }
        self.services.scheduler().forget(self.id);
        self.services.scaler().forget(self.id);
        tracing::trace!("image {} destroyed", self.id);
    }
}

/// Shared home of an image's state, the target services call back into
pub(crate) struct ImageCell {
    id: ImageId,
    state: RefCell<ImageState>,
    in_decoder: Rc<Cell<bool>>,
    observer: RefCell<Option<Weak<dyn ImageObserver>>>,
}

impl ImageCell {
    /// Run `f` on the state, then deliver the events it raised
    fn with_state<R>(&self, f: impl FnOnce(&mut ImageState) -> Result<R>) -> Result<R> {
        let (result, events) = {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return Err(ImageError::Reentrant);
            };
            let result = f(&mut state);
            (result, std::mem::take(&mut state.events))
        };
        self.dispatch(events);
        result
    }

    fn read<R>(&self, default: R, f: impl FnOnce(&ImageState) -> R) -> R {
        self.state.try_borrow().map_or(default, |state| f(&state))
    }

    fn dispatch(&self, events: Vec<PendingEvent>) {
        if events.is_empty() {
            return;
        }
        let observer = self.observer.borrow().as_ref().and_then(Weak::upgrade);
        let Some(observer) = observer else {
            return;
        };
        for pending in events {
            // Decoder events keep the decoder flag up for re-entrant calls
            let was_in_decoder = self.in_decoder.get();
            if pending.from_decoder {
                self.in_decoder.set(true);
            }
            observer.on_event(&pending.event);
            self.in_decoder.set(was_in_decoder);
        }
    }
}

impl DecodeTarget for ImageCell {
    fn decode_some(&self, max_bytes: usize, deadline: Instant) -> bool {
        self.with_state(|state| {
            state.decode_some_of_image(DecodeType::Normal, max_bytes, deadline)?;
            Ok(state.wants_more_decoding())
        })
        .unwrap_or(false)
    }
}

impl DiscardTarget for ImageCell {
    fn discard_expired(&self) {
        let _ = self.with_state(|state| {
            state.discard_expired();
            Ok(())
        });
    }
}

impl ScaleTarget for ImageCell {
    fn scale_ready(&self, unlock_source: bool, changed: Option<IntRect>) {
        let _ = self.with_state(|state| {
            if unlock_source {
                state.release_scale_lock();
            }
            if let Some(rect) = changed {
                if !state.error {
                    state.emit(ImageEvent::FrameChanged(rect));
                }
            }
            Ok(())
        });
    }
}

/// A raster image fed with compressed bytes
///
/// Dropping the image tears down its frames, decoder and service records.
pub struct RasterImage {
    cell: Rc<ImageCell>,
}

impl RasterImage {
    pub fn new(services: &ImageServices) -> Self {
        let id = services.allocate_id();
        let in_decoder = Rc::new(Cell::new(false));
        let cell = Rc::new_cyclic(|me| ImageCell {
            id,
            state: RefCell::new(ImageState::new(id, services.clone(), me.clone(), in_decoder.clone())),
            in_decoder,
            observer: RefCell::new(None),
        });
        Self { cell }
    }

    pub fn id(&self) -> ImageId {
        self.cell.id
    }

    /// Install the receiver of this image's events
    pub fn set_observer(&self, observer: Weak<dyn ImageObserver>) {
        *self.cell.observer.borrow_mut() = Some(observer);
    }

    /// Pick a decoder for `mime` and fix the image's flags
    pub fn init(&self, mime: &str, flags: InitFlags) -> Result<()> {
        self.cell.with_state(|state| state.init(mime, flags))
    }

    /// Feed the next bytes of the compressed source
    pub fn add_source_data(&self, data: &[u8]) -> Result<()> {
        self.cell.with_state(|state| state.add_source_data(data))
    }

    /// No more bytes will arrive for the current part
    pub fn source_data_complete(&self) -> Result<()> {
        self.cell.with_state(ImageState::source_data_complete)
    }

    /// Start the next part of a multipart image
    pub fn new_source_data(&self) -> Result<()> {
        self.cell.with_state(ImageState::new_source_data)
    }

    /// Ask for the image to be decoded soon
    ///
    /// From inside a decoder callback the request is posted to the host
    /// loop instead.
    pub fn request_decode(&self) -> Result<()> {
        self.cell.with_state(ImageState::request_decode)
    }

    /// Decode all buffered bytes before returning
    pub fn sync_decode(&self) -> Result<()> {
        self.cell.with_state(ImageState::sync_decode)
    }

    /// Frame to paint now, none if nothing is decoded yet
    pub fn draw(&self, params: &DrawParams) -> Result<Option<DrawnFrame>> {
        self.cell.with_state(|state| state.draw(params))
    }

    /// Full-size pixels of the first or current frame
    pub fn get_frame(&self, which: WhichFrame, flags: FrameFlags) -> Result<Arc<Pixmap>> {
        self.cell.with_state(|state| state.get_frame(which, flags))
    }

    /// Keep decoded frames alive until the matching unlock
    pub fn lock(&self) -> Result<()> {
        self.cell.with_state(ImageState::lock)
    }

    pub fn unlock(&self) -> Result<()> {
        self.cell.with_state(ImageState::unlock)
    }

    /// Discard right away if the image could be discarded by a sweep
    pub fn request_discard(&self) -> Result<()> {
        self.cell.with_state(ImageState::request_discard)
    }

    /// Drop decoded frames now, aborting any decode in flight
    pub fn discard(&self) -> Result<()> {
        self.cell.with_state(ImageState::discard_now)
    }

    pub fn set_animation_mode(&self, mode: AnimationMode) -> Result<()> {
        self.cell.with_state(|state| state.set_animation_mode(mode))
    }

    pub fn start_animation(&self) -> Result<()> {
        self.cell.with_state(ImageState::start_animation)
    }

    pub fn stop_animation(&self) -> Result<()> {
        self.cell.with_state(ImageState::stop_animation)
    }

    /// Rewind to the first frame
    pub fn reset_animation(&self) -> Result<()> {
        self.cell.with_state(ImageState::reset_animation)
    }

    /// Advance every frame whose display time ended by `now`
    pub fn request_refresh(&self, now: Instant) -> Result<()> {
        self.cell.with_state(|state| state.request_refresh(now))
    }

    pub fn width(&self) -> u32 {
        self.cell.read(0, |state| state.size.map_or(0, |size| size.width))
    }

    pub fn height(&self) -> u32 {
        self.cell.read(0, |state| state.size.map_or(0, |size| size.height))
    }

    pub fn has_size(&self) -> bool {
        self.cell.read(false, |state| state.size.is_some())
    }

    pub fn is_decoded(&self) -> bool {
        self.cell.read(false, |state| state.decoded)
    }

    pub fn has_error(&self) -> bool {
        self.cell.read(false, |state| state.error)
    }

    /// Error that put the image into its failed state
    pub fn error(&self) -> Option<ImageError> {
        self.cell.read(None, |state| state.last_error.clone())
    }

    pub fn lock_count(&self) -> u32 {
        self.cell.read(0, |state| state.lock_count)
    }

    pub fn can_discard(&self) -> bool {
        self.cell.read(false, ImageState::can_discard)
    }

    pub fn frame_count(&self) -> usize {
        self.cell.read(0, |state| state.frames.len())
    }

    pub fn is_animated(&self) -> bool {
        self.cell.read(false, |state| state.anim.is_some())
    }

    pub fn is_animating(&self) -> bool {
        self.cell.read(false, |state| state.playback.animating)
    }

    pub fn animation_finished(&self) -> bool {
        self.cell.read(false, |state| state.playback.finished)
    }

    pub fn current_frame_index(&self) -> usize {
        self.cell.read(0, ImageState::current_frame_index)
    }

    pub fn current_frame_rect(&self) -> Option<IntRect> {
        self.cell.read(None, |state| {
            state.frame_no_decode(state.current_frame_index()).map(Frame::rect)
        })
    }

    /// Current frame covers the canvas without transparency
    pub fn is_current_frame_opaque(&self) -> bool {
        self.cell.read(false, |state| {
            let (Some(size), Some(frame)) = (state.size, state.frame_no_decode(state.current_frame_index())) else {
                return false;
            };
            !frame.has_alpha() && frame.rect() == size.to_rect()
        })
    }

    pub fn source_size_bytes(&self) -> usize {
        self.cell.read(0, |state| state.source.len())
    }

    /// Bytes held by decoded frames and compositing buffers
    pub fn decoded_size_bytes(&self) -> usize {
        self.cell.read(0, |state| {
            state.frames.size_bytes() + state.anim.as_ref().map_or(0, AnimationState::size_bytes)
        })
    }

    /// Full decoders created so far
    pub fn decode_count(&self) -> u32 {
        self.cell.read(0, |state| state.decode_count)
    }
}

impl std::fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterImage")
            .field("id", &self.cell.id)
            .field("size", &self.cell.read(None, |state| state.size))
            .field("decoded", &self.is_decoded())
            .field("frames", &self.frame_count())
            .field("locks", &self.lock_count())
            .field("error", &self.has_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;

    fn image() -> (ImageServices, RasterImage) {
        let services = ImageServices::new(ImageConfig::default());
        let image = RasterImage::new(&services);
        (services, image)
    }

    #[test]
    fn test_multipart_flag_combinations() {
        let (_services, image) = image();
        let flags = InitFlags {
            multipart: true,
            discardable: true,
            ..Default::default()
        };
        assert!(matches!(image.init("image/png", flags), Err(ImageError::InvalidArgument(_))));
        // Non-sticky
        assert!(!image.has_error());
        assert!(image.init("image/png", InitFlags { multipart: true, ..Default::default() }).is_ok());
    }

    #[test]
    fn test_init_twice() {
        let (_services, image) = image();
        image.init("image/png", InitFlags::default()).unwrap();
        assert_eq!(image.init("image/png", InitFlags::default()), Err(ImageError::AlreadyInitialized));
    }

    #[test]
    fn test_unknown_mime_is_sticky() {
        let (_services, image) = image();
        assert_eq!(
            image.init("image/x-unknown", InitFlags::default()),
            Err(ImageError::NoDecoder("image/x-unknown".to_string()))
        );
        assert!(image.has_error());
        assert_eq!(image.add_source_data(&[1, 2, 3]), Err(ImageError::Failed));
        assert_eq!(image.lock(), Err(ImageError::Failed));
    }

    #[test]
    fn test_unlock_without_lock() {
        let (_services, image) = image();
        image.init("image/png", InitFlags::default()).unwrap();
        assert_eq!(image.unlock(), Err(ImageError::NotLocked));
        assert_eq!(image.lock_count(), 0);

        image.lock().unwrap();
        image.lock().unwrap();
        image.unlock().unwrap();
        assert_eq!(image.lock_count(), 1);
    }

    #[test]
    fn test_can_scale_rules() {
        let config = ImageConfig {
            hq_downscaling_enabled: true,
            hq_downscaling_min_factor: 500,
            ..Default::default()
        };
        let services = ImageServices::new(config);
        let image = RasterImage::new(&services);

        image.cell.with_state(|state| {
            assert!(!state.can_scale(Filter::Good, (0.4, 0.4)), "undecoded");
            state.decoded = true;
            assert!(state.can_scale(Filter::Good, (0.4, 0.4)));
            assert!(state.can_scale(Filter::Good, (0.9, 0.4)));
            assert!(!state.can_scale(Filter::Nearest, (0.4, 0.4)));
            assert!(!state.can_scale(Filter::Good, (0.6, 0.6)));
            assert!(!state.can_scale(Filter::Good, (1.5, 0.2)));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_add_before_init() {
        let (_services, image) = image();
        assert!(matches!(image.add_source_data(&[0; 4]), Err(ImageError::InvalidArgument(_))));
        assert!(!image.has_error());
    }

    // ========================================================================
    // Frame locks
    // ========================================================================

    fn png(width: u32, height: u32) -> Vec<u8> {
        let buffer = image::RgbaImage::from_pixel(width, height, image::Rgba([30, 60, 90, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        buffer.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn frame_locked(image: &RasterImage, index: usize) -> bool {
        image.cell.state.borrow().frames.get(index).is_some_and(Frame::is_locked)
    }

    #[test]
    fn test_frames_written_at_finish_end_unlocked() {
        let (services, image) = image();
        image.init("image/png", InitFlags::default()).unwrap();
        image.add_source_data(&png(8, 8)).unwrap();
        image.source_data_complete().unwrap();
        services.host().run_pending();

        assert!(image.is_decoded());
        assert_eq!(image.frame_count(), 1);
        assert!(!frame_locked(&image, 0));
    }

    #[test]
    fn test_late_scale_completion_spares_new_frames() {
        let config = ImageConfig {
            hq_downscaling_enabled: true,
            hq_downscaling_min_factor: 500,
            ..Default::default()
        };
        let services = ImageServices::new(config);
        let image = RasterImage::new(&services);
        image
            .init(
                "image/png",
                InitFlags {
                    discardable: true,
                    ..Default::default()
                },
            )
            .unwrap();
        image.add_source_data(&png(64, 64)).unwrap();
        image.source_data_complete().unwrap();
        services.host().run_pending();
        assert!(image.is_decoded());

        let params = DrawParams {
            filter: Filter::Good,
            scale: (0.25, 0.25),
            ..Default::default()
        };
        image.draw(&params).unwrap();
        assert!(frame_locked(&image, 0), "held while the job is out");

        image.discard().unwrap();
        let sync = FrameFlags {
            sync_decode: true,
            ..Default::default()
        };
        image.get_frame(WhichFrame::Current, sync).unwrap();
        assert!(image.is_decoded());
        assert!(!frame_locked(&image, 0));

        image.cell.state.borrow_mut().frames.get_mut(0).unwrap().lock_data();
        // The job started on the discarded frames reports back
        ScaleTarget::scale_ready(&*image.cell, true, None);
        assert!(frame_locked(&image, 0), "not the old job's lock to give back");
        services.shutdown();
    }
}
