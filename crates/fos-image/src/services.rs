//! Image Services
//!
//! The shared objects every image of one document talks to.

use std::cell::Cell;
use std::rc::Rc;

use crate::ImageId;
use crate::config::ImageConfig;
use crate::decoder::DecoderRegistry;
use crate::discard::DiscardTracker;
use crate::downscale::DownscalePipeline;
use crate::host::OwnerLoop;
use crate::scheduler::DecodeScheduler;

/// Scheduler, tracker, scaler and decoders shared by a set of images
///
/// Cloning is cheap; clones refer to the same services.
#[derive(Clone)]
pub struct ImageServices {
    inner: Rc<ServicesInner>,
}

struct ServicesInner {
    config: ImageConfig,
    host: OwnerLoop,
    scheduler: Rc<DecodeScheduler>,
    tracker: Rc<DiscardTracker>,
    scaler: Rc<DownscalePipeline>,
    decoders: DecoderRegistry,
    next_id: Cell<ImageId>,
}

impl ImageServices {
    /// Services with the built-in decoders
    pub fn new(config: ImageConfig) -> Self {
        Self::with_decoders(config, DecoderRegistry::with_builtin())
    }

    pub fn with_decoders(config: ImageConfig, decoders: DecoderRegistry) -> Self {
        let host = OwnerLoop::new();
        let scheduler = DecodeScheduler::new(&config, host.clone());
        let tracker = Rc::new(DiscardTracker::new(&config));
        let scaler = DownscalePipeline::new(host.clone());
        tracing::debug!(
            "image services up (discarding: {}, hq downscaling: {})",
            config.discarding_enabled,
            config.hq_downscaling_enabled
        );

        Self {
            inner: Rc::new(ServicesInner {
                config,
                host,
                scheduler,
                tracker,
                scaler,
                decoders,
                next_id: Cell::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.inner.config
    }

    /// Loop that runs scheduler ticks and scaler notices
    pub fn host(&self) -> &OwnerLoop {
        &self.inner.host
    }

    pub fn scheduler(&self) -> &Rc<DecodeScheduler> {
        &self.inner.scheduler
    }

    pub fn discard_tracker(&self) -> &Rc<DiscardTracker> {
        &self.inner.tracker
    }

    pub fn scaler(&self) -> &Rc<DownscalePipeline> {
        &self.inner.scaler
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.inner.decoders
    }

    pub(crate) fn allocate_id(&self) -> ImageId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Stop the background scaler thread
    pub fn shutdown(&self) {
        self.inner.scaler.shutdown();
    }
}

impl std::fmt::Debug for ImageServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageServices")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .field("tracker", &self.inner.tracker)
            .field("scaler", &self.inner.scaler)
            .field("decoders", &self.inner.decoders)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let services = ImageServices::new(ImageConfig::default());
        let a = services.allocate_id();
        let b = services.clone().allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_builtin_decoders_registered() {
        let services = ImageServices::new(ImageConfig::default());
        assert!(services.decoders().supports("image/png"));
        assert!(services.decoders().supports("IMAGE/GIF"));
        assert!(!services.decoders().supports("image/svg+xml"));
    }

    #[test]
    fn test_shutdown_without_worker() {
        let services = ImageServices::new(ImageConfig::default());
        services.shutdown();
        assert!(!services.scaler().stats().worker_running);
    }
}
