//! Animation Compositing
//!
//! Advances animated images frame by frame and composites partial frames
//! onto a full-canvas scratch buffer according to each frame's disposal and
//! blend methods.

use std::time::{Duration, Instant};

use crate::error::{ImageError, Result};
use crate::frame::{BlendMethod, DisposalMethod, Frame, FrameStore, PixelFormat};
use crate::geom::{IntRect, Size};

/// How an animated image plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnimationMode {
    /// Honour the image's loop count
    #[default]
    Normal,
    /// Play through once and stop
    LoopOnce,
    /// Show the first frame only
    DontAnimate,
}

/// Playback bookkeeping kept on the image
#[derive(Debug, Clone)]
pub(crate) struct Playback {
    pub mode: AnimationMode,
    /// Remaining loops, -1 for infinite
    pub loop_count: i32,
    /// Someone wants the image animated
    pub requested: bool,
    /// Refresh ticks are advancing frames
    pub animating: bool,
    /// Reached the end of its loops or an infinite frame
    pub finished: bool,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            mode: AnimationMode::Normal,
            loop_count: -1,
            requested: false,
            animating: false,
            finished: false,
        }
    }
}

impl Playback {
    pub fn finish(&mut self) {
        self.finished = true;
        self.animating = false;
    }

    /// Composites may be written back into the frame array
    fn may_memoize(&self) -> bool {
        self.mode == AnimationMode::Normal && self.loop_count != 0
    }
}

/// Per-image animation state, created with the second frame
#[derive(Debug)]
pub struct AnimationState {
    /// Index of the frame on screen
    pub(crate) current_index: usize,
    /// When the current frame went on screen
    pub(crate) current_frame_time: Instant,
    /// Area to repaint when wrapping back to frame 0
    pub(crate) first_frame_refresh_area: IntRect,
    /// Full-canvas scratch buffer
    pub(crate) compositing_frame: Option<Frame>,
    /// Canvas saved for a RestorePrevious frame
    pub(crate) compositing_prev_frame: Option<Frame>,
    /// Frame held in the scratch buffer; none means it must be rebuilt
    pub(crate) last_composited: Option<usize>,
}

impl AnimationState {
    pub fn new(now: Instant) -> Self {
        Self {
            current_index: 0,
            current_frame_time: now,
            first_frame_refresh_area: IntRect::default(),
            compositing_frame: None,
            compositing_prev_frame: None,
            last_composited: None,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn first_frame_refresh_area(&self) -> IntRect {
        self.first_frame_refresh_area
    }

    pub fn last_composited_index(&self) -> Option<usize> {
        self.last_composited
    }

    pub(crate) fn composite(&self) -> Option<&Frame> {
        self.compositing_frame.as_ref()
    }

    pub(crate) fn grow_refresh_area(&mut self, rect: IntRect) {
        self.first_frame_refresh_area = self.first_frame_refresh_area.union(&rect);
    }

    /// Back to frame 0 with the scratch buffer marked stale
    pub(crate) fn rewind(&mut self) {
        self.current_index = 0;
        self.last_composited = None;
    }

    /// End of the current frame, none for a frame shown forever
    pub(crate) fn current_frame_end(&self, timeout: i32) -> Option<Instant> {
        if timeout < 0 {
            return None;
        }
        Some(self.current_frame_time + Duration::from_millis(timeout as u64))
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.compositing_frame.as_ref().map_or(0, Frame::size_bytes)
            + self.compositing_prev_frame.as_ref().map_or(0, Frame::size_bytes)
    }
}

/// Move to the next frame if it is ready
///
/// `complete_frames` is the decoder's count of displayable frames while a
/// decoder is live. Returns the dirty rect when the displayed frame changed.
pub(crate) fn advance_frame(
    anim: &mut AnimationState,
    frames: &mut FrameStore,
    canvas: Size,
    playback: &mut Playback,
    complete_frames: Option<usize>,
    now: Instant,
) -> Option<IntRect> {
    let current = anim.current_index;
    let mut next = current + 1;

    // Frames are appended before they are filled in
    if complete_frames.is_some_and(|count| next >= count) {
        return None;
    }

    if next == frames.len() {
        if playback.mode == AnimationMode::LoopOnce || playback.loop_count == 0 {
            playback.finish();
        }
        // The composite was copied back into the frame array; free it
        if anim.last_composited.is_none() {
            anim.compositing_frame = None;
        }
        next = 0;
        if playback.loop_count > 0 {
            playback.loop_count -= 1;
        }
        if !playback.animating {
            return None;
        }
    }

    if frames.get(next).is_none() {
        anim.current_index = next;
        return None;
    }

    let dirty = if next == 0 {
        anim.first_frame_refresh_area
    } else {
        if frames.get(current).is_none() {
            return None;
        }
        let composited = do_composite(anim, frames, canvas, current, next, playback);
        let failed = composited.is_err();
        if let Some(frame) = frames.get_mut(next) {
            frame.set_compositing_failed(failed);
        }
        match composited {
            Ok(dirty) => dirty,
            Err(e) => {
                tracing::warn!("compositing frame {} failed: {}", next, e);
                anim.current_index = next;
                anim.current_frame_time = now;
                return None;
            }
        }
    };

    anim.current_index = next;
    anim.current_frame_time = now;
    Some(dirty)
}

/// Build the canvas for `next_index` on top of `prev_index`; returns the dirty rect
pub(crate) fn do_composite(
    anim: &mut AnimationState,
    frames: &mut FrameStore,
    canvas: Size,
    prev_index: usize,
    next_index: usize,
    playback: &Playback,
) -> Result<IntRect> {
    let canvas_rect = canvas.to_rect();
    let missing = || ImageError::invalid("composite of a missing frame");

    let prev = frames.get(prev_index).ok_or_else(missing)?;
    let prev_rect = prev.rect();
    let prev_paletted = prev.is_paletted();
    let prev_has_alpha = prev.has_alpha();
    let mut prev_disposal = prev.disposal();

    if prev_disposal == DisposalMethod::RestorePrevious && anim.compositing_prev_frame.is_none() {
        prev_disposal = DisposalMethod::Clear;
    }
    let is_full_prev = prev_rect == canvas_rect;
    if is_full_prev && prev_disposal == DisposalMethod::Clear {
        prev_disposal = DisposalMethod::ClearAll;
    }

    let next = frames.get(next_index).ok_or_else(missing)?;
    let next_rect = next.rect();
    let next_disposal = next.disposal();
    let next_paletted = next.is_paletted();
    let next_has_alpha = next.has_alpha();
    let is_full_next = next_rect == canvas_rect;

    if !next_paletted {
        // Whole canvas gets cleared anyway
        if prev_disposal == DisposalMethod::ClearAll {
            return Ok(canvas_rect);
        }
        // Next frame paints over everything
        if is_full_next && next_disposal != DisposalMethod::RestorePrevious && !next_has_alpha {
            return Ok(canvas_rect);
        }
    }

    let dirty = match prev_disposal {
        DisposalMethod::Keep => next_rect,
        DisposalMethod::Clear => next_rect.union(&prev_rect),
        DisposalMethod::ClearAll | DisposalMethod::RestorePrevious => canvas_rect,
    };

    if anim.last_composited == Some(next_index) {
        return Ok(dirty);
    }

    let last_composited = anim.last_composited;
    let mut need_to_blank = false;
    if anim.compositing_frame.is_none() {
        anim.compositing_frame = Some(Frame::new(canvas_rect, PixelFormat::Rgba, 0)?);
        need_to_blank = true;
    } else if last_composited.map_or(true, |index| index + 1 != next_index) {
        need_to_blank = true;
    }

    let mut do_disposal = true;
    if !next_has_alpha && next_disposal != DisposalMethod::RestorePrevious {
        if is_full_next {
            do_disposal = false;
            need_to_blank = false;
        } else if next_rect.contains(&prev_rect) {
            do_disposal = false;
        }
    }

    let AnimationState {
        compositing_frame,
        compositing_prev_frame,
        ..
    } = anim;
    let Some(composite) = compositing_frame.as_mut() else {
        return Err(ImageError::NotAvailable);
    };

    if do_disposal {
        match prev_disposal {
            DisposalMethod::Clear => {
                if need_to_blank {
                    clear_frame(composite);
                } else {
                    clear_rect(composite, prev_rect);
                }
            }
            DisposalMethod::ClearAll => clear_frame(composite),
            DisposalMethod::RestorePrevious => match compositing_prev_frame.as_ref() {
                Some(saved) => {
                    copy_frame_image(saved, composite);
                    if next_disposal != DisposalMethod::RestorePrevious {
                        *compositing_prev_frame = None;
                    }
                }
                None => clear_frame(composite),
            },
            DisposalMethod::Keep => {
                // Nothing to do if the scratch buffer already holds prev
                if last_composited != Some(next_index - 1) {
                    let prev = frames.get(prev_index).ok_or_else(missing)?;
                    if is_full_prev && !prev_paletted {
                        copy_frame_image(prev, composite);
                    } else {
                        if need_to_blank && (prev_has_alpha || !is_full_prev) {
                            clear_frame(composite);
                        }
                        draw_frame_to(prev, composite, prev_rect)?;
                    }
                }
            }
        }
    } else if need_to_blank {
        clear_frame(composite);
    }

    if next_disposal == DisposalMethod::RestorePrevious && prev_disposal != DisposalMethod::RestorePrevious {
        if compositing_prev_frame.is_none() {
            *compositing_prev_frame = Some(Frame::new(canvas_rect, PixelFormat::Rgba, 0)?);
        }
        if let Some(saved) = compositing_prev_frame.as_mut() {
            copy_frame_image(composite, saved);
        }
    }

    let next = frames.get(next_index).ok_or_else(missing)?;
    draw_frame_to(next, composite, next_rect)?;
    composite.set_timeout(next.raw_timeout());

    if is_full_next
        && playback.may_memoize()
        && next_disposal != DisposalMethod::RestorePrevious
        && !next_paletted
    {
        // Keep the finished canvas in the frame array so later loops skip this composite
        let copied = frames
            .get_mut(next_index)
            .is_some_and(|frame| copy_frame_image(composite, frame));
        if copied {
            if let Some(prev) = frames.get_mut(prev_index) {
                prev.set_disposal(DisposalMethod::ClearAll);
            }
            anim.last_composited = None;
            return Ok(dirty);
        }
    }

    anim.last_composited = Some(next_index);
    Ok(dirty)
}

/// Erase a frame to transparent
pub(crate) fn clear_frame(frame: &mut Frame) {
    frame.data_mut().fill(0);
}

/// Erase `rect` of a non-paletted frame, clipped to its bounds
pub(crate) fn clear_rect(frame: &mut Frame, rect: IntRect) {
    if frame.is_paletted() {
        return;
    }
    let bounds = IntRect::new(0, 0, frame.rect().width, frame.rect().height);
    let area = rect.intersect(&bounds);
    if area.is_empty() {
        return;
    }
    let stride = bounds.width as usize * 4;
    let data = frame.data_mut();
    for row in area.y..area.bottom() {
        let start = row as usize * stride + area.x as usize * 4;
        data[start..start + area.width as usize * 4].fill(0);
    }
}

/// Copy pixels between same-sized non-paletted frames
pub(crate) fn copy_frame_image(src: &Frame, dst: &mut Frame) -> bool {
    if src.is_paletted() || dst.is_paletted() || src.data().len() != dst.data().len() {
        return false;
    }
    dst.data_mut().copy_from_slice(src.data());
    true
}

/// Composite `src` into `dst` at `src_rect`, clipped to `dst`
pub(crate) fn draw_frame_to(src: &Frame, dst: &mut Frame, src_rect: IntRect) -> Result<()> {
    if src_rect.x < 0 || src_rect.y < 0 {
        return Err(ImageError::invalid("negative frame offset"));
    }
    let dst_width = dst.rect().width;
    let dst_height = dst.rect().height;
    if src_rect.x > dst_width || src_rect.y > dst_height {
        return Ok(());
    }

    let width = src_rect.width.min(dst_width - src_rect.x);
    let height = src_rect.height.min(dst_height - src_rect.y);
    if width <= 0 || height <= 0 {
        return Ok(());
    }

    let src_stride = src_rect.width as usize;
    let dst_stride = dst_width as usize;
    let (x0, y0) = (src_rect.x as usize, src_rect.y as usize);

    if src.is_paletted() {
        let has_alpha = src.has_alpha();
        let indices = src.data();
        let out = dst.data_mut();
        for row in 0..height as usize {
            for col in 0..width as usize {
                let color = src.palette_color(indices[row * src_stride + col]);
                if has_alpha && color == [0; 4] {
                    continue;
                }
                let o = ((y0 + row) * dst_stride + x0 + col) * 4;
                out[o..o + 4].copy_from_slice(&color);
            }
        }
        return Ok(());
    }

    if src.blend() == BlendMethod::Source {
        clear_rect(dst, IntRect::new(src_rect.x, src_rect.y, width, height));
    }

    let pixels = src.data();
    let out = dst.data_mut();
    for row in 0..height as usize {
        for col in 0..width as usize {
            let s = (row * src_stride + col) * 4;
            let o = ((y0 + row) * dst_stride + x0 + col) * 4;
            blend_over(&mut out[o..o + 4], &pixels[s..s + 4]);
        }
    }
    Ok(())
}

/// Premultiplied source-over
fn blend_over(dst: &mut [u8], src: &[u8]) {
    let alpha = src[3];
    if alpha == 255 {
        dst.copy_from_slice(src);
        return;
    }
    if alpha == 0 {
        return;
    }
    let inv = 255 - alpha as u32;
    for i in 0..4 {
        dst[i] = (src[i] as u32 + (dst[i] as u32 * inv + 127) / 255).min(255) as u8;
    }
}
