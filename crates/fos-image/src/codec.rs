//! Built-in Decoders
//!
//! Buffering adapters over the image crate for PNG, JPEG, GIF, WebP, BMP and ICO.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::metadata::LoopCount;
use image::{AnimationDecoder, ImageFormat as ImgFormat, ImageReader};

use crate::decoder::{DecodeFlags, Decoder, DecoderRegistry, DecoderSink};
use crate::error::ImageError;
use crate::frame::{BlendMethod, DisposalMethod, PixelFormat};
use crate::geom::IntRect;

/// Formats handled by the built-in decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Ico,
}

impl Codec {
    /// Detect format from magic bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }
        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        // WebP: RIFF....WEBP
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }
        if data.starts_with(b"BM") {
            return Some(Self::Bmp);
        }
        if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
            return Some(Self::Ico);
        }
        None
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "image/png" | "image/x-png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/x-icon" | "image/vnd.microsoft.icon" => Some(Self::Ico),
            _ => None,
        }
    }

    /// Canonical mime type
    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Ico => "image/x-icon",
        }
    }

    fn to_image_format(self) -> ImgFormat {
        match self {
            Self::Png => ImgFormat::Png,
            Self::Jpeg => ImgFormat::Jpeg,
            Self::Gif => ImgFormat::Gif,
            Self::WebP => ImgFormat::WebP,
            Self::Bmp => ImgFormat::Bmp,
            Self::Ico => ImgFormat::Ico,
        }
    }
}

/// Guess a mime type from the leading bytes of an image
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    Codec::from_bytes(data).map(Codec::mime)
}

pub(crate) fn register_builtin(registry: &mut DecoderRegistry) {
    const MIMES: &[&str] = &[
        "image/png",
        "image/x-png",
        "image/jpeg",
        "image/jpg",
        "image/pjpeg",
        "image/gif",
        "image/webp",
        "image/bmp",
        "image/x-ms-bmp",
        "image/x-icon",
        "image/vnd.microsoft.icon",
    ];
    for &mime in MIMES {
        if let Some(codec) = Codec::from_mime(mime) {
            registry.register(mime, move || Box::new(BufferedDecoder::new(codec)));
        }
    }
}

/// Decoder that collects bytes and decodes once input is finished
///
/// The size is reported as soon as the header parses.
pub struct BufferedDecoder {
    codec: Codec,
    data: Vec<u8>,
    size_decode: bool,
    flags: DecodeFlags,
    size_posted: bool,
    finished: bool,
    interrupted: bool,
    complete_frames: usize,
    error: Option<ImageError>,
}

impl BufferedDecoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            data: Vec::new(),
            size_decode: false,
            flags: DecodeFlags::default(),
            size_posted: false,
            finished: false,
            interrupted: false,
            complete_frames: 0,
            error: None,
        }
    }

    fn post_size(&mut self, sink: &mut DecoderSink<'_>) {
        if self.size_posted {
            return;
        }
        let reader = ImageReader::with_format(Cursor::new(self.data.as_slice()), self.codec.to_image_format());
        // Truncated headers fail here; retry on the next write.
        let Ok((width, height)) = reader.into_dimensions() else {
            return;
        };
        self.size_posted = true;
        if let Err(e) = sink.set_size(width, height) {
            self.error = Some(e);
        }
    }

    fn decode_still(&mut self, sink: &mut DecoderSink<'_>) -> Result<(), ImageError> {
        let decoded = image::load_from_memory_with_format(&self.data, self.codec.to_image_format())
            .map_err(|e| ImageError::Decoder(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let rect = IntRect::new(0, 0, rgba.width() as i32, rgba.height() as i32);

        let frame = sink.ensure_frame(0, rect, PixelFormat::Rgba, 0)?;
        copy_pixels(frame.data_mut(), rgba.as_raw(), self.flags);
        sink.frame_updated(0, rect);
        sink.frame_complete(0);
        self.complete_frames = 1;
        Ok(())
    }

    fn decode_gif(&mut self, sink: &mut DecoderSink<'_>) -> Result<(), ImageError> {
        let decoder = GifDecoder::new(Cursor::new(self.data.as_slice()))
            .map_err(|e| ImageError::Decoder(e.to_string()))?;
        sink.set_loop_count(match decoder.loop_count() {
            LoopCount::Infinite => -1,
            LoopCount::Finite(n) => i32::try_from(n.get()).unwrap_or(i32::MAX),
        });
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| ImageError::Decoder(e.to_string()))?;

        for (index, gif_frame) in frames.iter().enumerate() {
            let buffer = gif_frame.buffer();
            let rect = IntRect::new(
                gif_frame.left() as i32,
                gif_frame.top() as i32,
                buffer.width() as i32,
                buffer.height() as i32,
            );
            let frame = sink.ensure_frame(index, rect, PixelFormat::Rgba, 0)?;
            copy_pixels(frame.data_mut(), buffer.as_raw(), self.flags);

            // Frames arrive already composited onto the full canvas.
            let (numer, denom) = gif_frame.delay().numer_denom_ms();
            let delay = if denom == 0 { 0 } else { (numer / denom) as i32 };
            sink.set_frame_timeout(index, delay)?;
            sink.set_frame_disposal(index, DisposalMethod::Keep)?;
            sink.set_frame_blend(index, BlendMethod::Source)?;
            sink.frame_updated(index, rect);
            sink.frame_complete(index);
            self.complete_frames = index + 1;
        }
        Ok(())
    }
}

impl Decoder for BufferedDecoder {
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
        if self.error.is_some() || self.finished {
            return;
        }
        self.data.extend_from_slice(data);
        self.post_size(sink);
    }

    fn finish(&mut self, sink: &mut DecoderSink<'_>) {
        if self.finished || self.error.is_some() {
            return;
        }
        self.finished = true;
        self.post_size(sink);
        if self.size_decode || self.interrupted || self.error.is_some() || self.data.is_empty() {
            return;
        }

        let result = match self.codec {
            Codec::Gif => self.decode_gif(sink),
            _ => self.decode_still(sink),
        };
        if let Err(e) = result.and_then(|_| sink.decoding_complete()) {
            self.error = Some(e);
        }
    }

    fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn error(&self) -> Option<ImageError> {
        self.error.clone()
    }

    fn complete_frame_count(&self) -> usize {
        self.complete_frames
    }
}

/// Copy straight RGBA into a frame, premultiplying unless told not to
fn copy_pixels(dst: &mut [u8], src: &[u8], flags: DecodeFlags) {
    for (out, px) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let a = px[3];
        if flags.no_premultiply_alpha || a == 255 {
            out.copy_from_slice(px);
        } else {
            out[0] = premultiply(px[0], a);
            out[1] = premultiply(px[1], a);
            out[2] = premultiply(px[2], a);
            out[3] = a;
        }
    }
}

fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u32 * a as u32 + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        assert_eq!(sniff_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]), Some("image/png"));
        assert_eq!(sniff_mime(b"GIF89a\x01\x00"), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"hello"), None);
    }

    #[test]
    fn test_mime_aliases() {
        assert_eq!(Codec::from_mime("IMAGE/JPG"), Some(Codec::Jpeg));
        assert_eq!(Codec::from_mime("image/x-ms-bmp"), Some(Codec::Bmp));
        assert_eq!(Codec::from_mime("text/html"), None);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = DecoderRegistry::with_builtin();
        assert!(registry.supports("image/png"));
        assert!(registry.supports("image/vnd.microsoft.icon"));
        assert!(!registry.supports("image/svg+xml"));
        let decoder = registry.create("image/gif").unwrap();
        assert!(!decoder.is_size_decode());
    }

    #[test]
    fn test_premultiply() {
        let mut out = [0u8; 8];
        copy_pixels(&mut out, &[255, 128, 0, 128, 10, 20, 30, 255], DecodeFlags::default());
        assert_eq!(out, [128, 64, 0, 128, 10, 20, 30, 255]);

        let straight = DecodeFlags { no_premultiply_alpha: true, ..Default::default() };
        copy_pixels(&mut out, &[255, 128, 0, 128, 0, 0, 0, 0], straight);
        assert_eq!(&out[..4], &[255, 128, 0, 128]);
    }
}
