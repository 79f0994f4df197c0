//! Image Observers
//!
//! Notifications an image sends to whoever paints it.

use crate::geom::IntRect;

/// Notification raised by an image
#[derive(Debug, Clone, PartialEq)]
pub enum ImageEvent {
    /// Intrinsic size became known
    SizeAvailable { width: u32, height: u32 },
    /// Pixels inside the rect changed
    FrameChanged(IntRect),
    /// A frame finished decoding
    FrameComplete(usize),
    /// Every frame finished decoding
    DecodeComplete,
    /// Decoded frames were released
    Discarded,
    /// The image entered its permanent error state
    Error,
}

/// Receiver of image notifications
///
/// Images hold observers weakly. Observers may call back into the image;
/// calls that would re-enter a running decoder are deferred to the host loop.
pub trait ImageObserver {
    fn on_event(&self, event: &ImageEvent);
}
