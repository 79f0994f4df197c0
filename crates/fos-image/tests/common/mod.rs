//! Shared test helpers
//!
//! "FIMG" is a tiny streaming format used to drive the pipeline with exact
//! byte counts and any chunking:
//!
//! ```text
//! header  "FIMG" | width u16 | height u16 | frames u8 | loops i8         (10 bytes)
//! frame   x u16 | y u16 | w u16 | h u16 | disposal u8 | blend u8
//!         | timeout i16 | has_alpha u8 | reserved u8                     (14 bytes)
//!         then w * h * 4 bytes of premultiplied RGBA
//! ```
//!
//! All integers are little endian.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fos_image::{
    BlendMethod, DecodeFlags, Decoder, DecoderRegistry, DecoderSink, DisposalMethod, ImageConfig, ImageError,
    ImageEvent, ImageObserver, ImageServices, IntRect, PixelFormat,
};

pub const FIMG_MIME: &str = "image/x-fimg";
/// Every decoder of this type reports a wider image than the last
pub const GROWING_MIME: &str = "image/x-fimg-growing";

const HEADER_LEN: usize = 10;
const FRAME_HEADER_LEN: usize = 14;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Encoder
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct FrameSpec {
    pub rect: IntRect,
    pub disposal: DisposalMethod,
    pub blend: BlendMethod,
    pub timeout: i16,
    pub color: [u8; 4],
}

impl FrameSpec {
    pub fn solid(rect: IntRect, color: [u8; 4]) -> Self {
        Self {
            rect,
            disposal: DisposalMethod::Keep,
            blend: BlendMethod::Over,
            timeout: 100,
            color,
        }
    }

    pub fn disposal(mut self, disposal: DisposalMethod) -> Self {
        self.disposal = disposal;
        self
    }

    pub fn timeout(mut self, timeout: i16) -> Self {
        self.timeout = timeout;
        self
    }
}

pub fn encode(width: u16, height: u16, loops: i8, frames: &[FrameSpec]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"FIMG");
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.push(frames.len() as u8);
    out.push(loops as u8);

    for frame in frames {
        let rect = frame.rect;
        for v in [rect.x, rect.y, rect.width, rect.height] {
            out.extend_from_slice(&(v as u16).to_le_bytes());
        }
        out.push(match frame.disposal {
            DisposalMethod::Keep => 0,
            DisposalMethod::Clear => 1,
            DisposalMethod::ClearAll => 2,
            DisposalMethod::RestorePrevious => 3,
        });
        out.push(match frame.blend {
            BlendMethod::Over => 0,
            BlendMethod::Source => 1,
        });
        out.extend_from_slice(&frame.timeout.to_le_bytes());
        out.push(u8::from(frame.color[3] != 255));
        out.push(0);
        for _ in 0..rect.width * rect.height {
            out.extend_from_slice(&frame.color);
        }
    }
    out
}

/// Opaque single-frame image
pub fn still(width: u16, height: u16, color: [u8; 4]) -> Vec<u8> {
    encode(
        width,
        height,
        0,
        &[FrameSpec::solid(IntRect::new(0, 0, width as i32, height as i32), color)],
    )
}

/// 61x4 single frame, exactly 1000 bytes
pub fn thousand_byte_image() -> Vec<u8> {
    let data = still(61, 4, [10, 20, 30, 255]);
    assert_eq!(data.len(), 1000);
    data
}

/// A PNG produced by the `image` crate
pub fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let buffer = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
    let mut out = std::io::Cursor::new(Vec::new());
    buffer
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png encoding");
    out.into_inner()
}

/// An animated GIF produced by the `image` crate, one solid 100 ms frame per color
pub fn gif(width: u32, height: u32, repeat: image::codecs::gif::Repeat, colors: &[[u8; 4]]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = image::codecs::gif::GifEncoder::new(&mut out);
        encoder.set_repeat(repeat).expect("gif repeat");
        for &color in colors {
            let buffer = image::RgbaImage::from_pixel(width, height, image::Rgba(color));
            let frame = image::Frame::from_parts(buffer, 0, 0, image::Delay::from_numer_denom_ms(100, 1));
            encoder.encode_frame(frame).expect("gif frame");
        }
    }
    out
}

// ============================================================================
// Decoder
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Header {
    frames: usize,
}

#[derive(Debug, Clone, Copy)]
struct InProgress {
    index: usize,
    rect: IntRect,
    written: usize,
}

pub struct FimgDecoder {
    pending: Vec<u8>,
    size_decode: bool,
    flags: DecodeFlags,
    header: Option<Header>,
    current: Option<InProgress>,
    next_frame: usize,
    complete: usize,
    done: bool,
    width_bonus: u32,
    error: Option<ImageError>,
}

impl FimgDecoder {
    pub fn new() -> Self {
        Self::with_width_bonus(0)
    }

    /// Report a width `bonus` pixels larger than the header says
    pub fn with_width_bonus(bonus: u32) -> Self {
        Self {
            pending: Vec::new(),
            size_decode: false,
            flags: DecodeFlags::default(),
            header: None,
            current: None,
            next_frame: 0,
            complete: 0,
            done: false,
            width_bonus: bonus,
            error: None,
        }
    }

    fn process(&mut self, sink: &mut DecoderSink<'_>) -> Result<(), ImageError> {
        loop {
            let Some(header) = self.header else {
                if self.pending.len() < HEADER_LEN {
                    return Ok(());
                }
                if &self.pending[..4] != b"FIMG" {
                    return Err(ImageError::Decoder("bad FIMG magic".into()));
                }
                let width = u16::from_le_bytes([self.pending[4], self.pending[5]]) as u32;
                let height = u16::from_le_bytes([self.pending[6], self.pending[7]]) as u32;
                let frames = self.pending[8] as usize;
                let loops = self.pending[9] as i8;
                self.pending.drain(..HEADER_LEN);

                self.header = Some(Header { frames });
                sink.set_size(width + self.width_bonus, height)?;
                sink.set_loop_count(loops as i32);
                continue;
            };
            if self.size_decode || self.done {
                return Ok(());
            }

            if let Some(mut current) = self.current {
                let total = current.rect.width as usize * current.rect.height as usize * 4;
                let n = (total - current.written).min(self.pending.len());
                if n > 0 {
                    let frame = sink.frame_mut(current.index).ok_or(ImageError::NotAvailable)?;
                    frame.data_mut()[current.written..current.written + n].copy_from_slice(&self.pending[..n]);
                    self.pending.drain(..n);

                    let stride = current.rect.width as usize * 4;
                    let first_row = current.written / stride;
                    let end_row = (current.written + n).div_ceil(stride);
                    current.written += n;
                    sink.frame_updated(
                        current.index,
                        IntRect::new(
                            current.rect.x,
                            current.rect.y + first_row as i32,
                            current.rect.width,
                            (end_row - first_row) as i32,
                        ),
                    );
                }

                if current.written < total {
                    self.current = Some(current);
                    return Ok(());
                }
                self.current = None;
                self.complete += 1;
                sink.frame_complete(current.index);
                if self.complete == header.frames {
                    self.done = true;
                    return sink.decoding_complete();
                }
                continue;
            }

            if self.next_frame >= header.frames || self.pending.len() < FRAME_HEADER_LEN {
                return Ok(());
            }
            let field = |i: usize| u16::from_le_bytes([self.pending[i], self.pending[i + 1]]) as i32;
            let rect = IntRect::new(field(0), field(2), field(4), field(6));
            let disposal = match self.pending[8] {
                1 => DisposalMethod::Clear,
                2 => DisposalMethod::ClearAll,
                3 => DisposalMethod::RestorePrevious,
                _ => DisposalMethod::Keep,
            };
            let blend = if self.pending[9] == 1 { BlendMethod::Source } else { BlendMethod::Over };
            let timeout = i16::from_le_bytes([self.pending[10], self.pending[11]]) as i32;
            let has_alpha = self.pending[12] != 0;
            self.pending.drain(..FRAME_HEADER_LEN);

            let index = self.next_frame;
            self.next_frame += 1;
            let frame = sink.ensure_frame(index, rect, PixelFormat::Rgba, 0)?;
            frame.set_disposal(disposal);
            frame.set_blend(blend);
            frame.set_timeout(timeout);
            frame.set_has_alpha(has_alpha);
            self.current = Some(InProgress { index, rect, written: 0 });
        }
    }
}

impl Default for FimgDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FimgDecoder {
    fn set_size_decode(&mut self, size_decode: bool) {
        self.size_decode = size_decode;
    }

    fn is_size_decode(&self) -> bool {
        self.size_decode
    }

    fn set_decode_flags(&mut self, flags: DecodeFlags) {
        self.flags = flags;
    }

    fn decode_flags(&self) -> DecodeFlags {
        self.flags
    }

    fn write(&mut self, data: &[u8], sink: &mut DecoderSink<'_>) {
        if self.error.is_some() || self.done {
            return;
        }
        self.pending.extend_from_slice(data);
        if let Err(e) = self.process(sink) {
            self.error = Some(e);
        }
    }

    fn finish(&mut self, _sink: &mut DecoderSink<'_>) {}

    fn error(&self) -> Option<ImageError> {
        self.error.clone()
    }

    fn complete_frame_count(&self) -> usize {
        self.complete
    }
}

/// Registry with FIMG plus the built-in decoders
pub fn registry() -> DecoderRegistry {
    let mut registry = DecoderRegistry::with_builtin();
    registry.register(FIMG_MIME, || Box::new(FimgDecoder::new()) as Box<dyn Decoder>);

    let created = Rc::new(Cell::new(0u32));
    registry.register(GROWING_MIME, move || {
        let bonus = created.get();
        created.set(bonus + 1);
        Box::new(FimgDecoder::with_width_bonus(bonus)) as Box<dyn Decoder>
    });
    registry
}

pub fn services(config: ImageConfig) -> ImageServices {
    init_tracing();
    ImageServices::with_decoders(config, registry())
}

// ============================================================================
// Observer
// ============================================================================

type Hook = Box<dyn Fn(&ImageEvent)>;

/// Records every event, optionally running a hook on each
#[derive(Default)]
pub struct RecordingObserver {
    events: RefCell<Vec<ImageEvent>>,
    hook: RefCell<Option<Hook>>,
}

impl RecordingObserver {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set_hook(&self, hook: impl Fn(&ImageEvent) + 'static) {
        *self.hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<ImageEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&ImageEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|event| pred(event)).count()
    }

    pub fn changed_rects(&self) -> Vec<IntRect> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ImageEvent::FrameChanged(rect) => Some(*rect),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl ImageObserver for RecordingObserver {
    fn on_event(&self, event: &ImageEvent) {
        self.events.borrow_mut().push(event.clone());
        if let Some(hook) = self.hook.borrow().as_ref() {
            hook(event);
        }
    }
}

pub fn observe(image: &fos_image::RasterImage) -> Rc<RecordingObserver> {
    let observer = RecordingObserver::new();
    let weak: std::rc::Weak<RecordingObserver> = Rc::downgrade(&observer);
    image.set_observer(weak);
    observer
}
