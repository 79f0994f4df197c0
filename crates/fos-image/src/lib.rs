//! fOS Image
//!
//! Raster image decode, cache and animation pipeline.
//!
//! Images are fed compressed bytes incrementally, decoded in time-sliced
//! chunks on the owner thread, composited when animated, discarded under
//! memory pressure and optionally pre-downscaled on a background thread.
//!
//! # Example
//! ```rust,ignore
//! use fos_image::{ImageConfig, ImageServices, InitFlags, RasterImage};
//!
//! let services = ImageServices::new(ImageConfig::default());
//! let image = RasterImage::new(&services);
//! image.init("image/png", InitFlags { discardable: true, ..Default::default() })?;
//! image.add_source_data(&bytes)?;
//! image.source_data_complete()?;
//! services.host().run_pending();
//! ```

pub mod animation;
pub mod codec;
mod config;
pub mod decoder;
pub mod discard;
pub mod downscale;
mod error;
pub mod frame;
mod geom;
pub mod host;
pub mod observer;
mod raster;
pub mod scheduler;
mod services;

pub use animation::{AnimationMode, AnimationState};
pub use codec::sniff_mime;
pub use config::ImageConfig;
pub use decoder::{DecodeFlags, Decoder, DecoderRegistry, DecoderSink};
pub use discard::DiscardTracker;
pub use downscale::DownscalePipeline;
pub use error::{ImageError, Result};
pub use frame::{BlendMethod, DisposalMethod, Frame, FrameStore, PixelFormat};
pub use geom::{IntRect, Size};
pub use host::OwnerLoop;
pub use observer::{ImageEvent, ImageObserver};
pub use raster::{DrawParams, DrawnFrame, Filter, FrameFlags, InitFlags, RasterImage, WhichFrame};
pub use scheduler::DecodeScheduler;
pub use services::ImageServices;

/// Stable identity of an image within one set of services
pub type ImageId = u64;
