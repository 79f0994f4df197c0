//! Downscale Pipeline
//!
//! Best-effort high quality downscaling of decoded still images. Jobs are
//! computed on a single lazily started background thread; results are
//! handed back to the owner thread through a channel drained by a task on
//! the [`OwnerLoop`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::imageops::{self, FilterType};
use smol::channel::{self, Receiver, Sender};
use tiny_skia::{IntSize, Pixmap};

use crate::ImageId;
use crate::geom::IntRect;
use crate::host::OwnerLoop;

/// Image that owns a scale request
pub(crate) trait ScaleTarget {
    /// A background job came back
    ///
    /// `unlock_source` releases the lock taken on the source frame when the
    /// job was queued. `changed` is set when a new scaled frame is ready.
    fn scale_ready(&self, unlock_source: bool, changed: Option<IntRect>);
}

/// Result of looking up a scaled frame
#[derive(Debug, Clone)]
pub enum ScaleLookup {
    /// Scaled pixels for the requested factor
    Ready(Arc<Pixmap>),
    /// A job for this factor is queued or running
    InFlight,
    /// Nothing usable
    Absent,
}

#[derive(Debug)]
struct ScaleRequest {
    scale: (f32, f32),
    /// Source pixels shared with the background thread
    src: Option<Arc<Pixmap>>,
    /// Canvas rect of the source frame
    src_rect: IntRect,
    dst: Option<Arc<Pixmap>>,
    done: bool,
    stopped: bool,
    /// The image holds a lock on the source frame for this request
    src_locked: bool,
}

impl ScaleRequest {
    fn new() -> Self {
        Self {
            scale: (0.0, 0.0),
            src: None,
            src_rect: IntRect::default(),
            dst: None,
            done: false,
            stopped: false,
            src_locked: false,
        }
    }

    /// Drop a finished result and forget its factor
    fn release_result(&mut self) {
        if self.done {
            self.done = false;
            self.dst = None;
            self.scale = (0.0, 0.0);
        }
    }
}

#[derive(Default)]
struct ScaleQueue {
    pending: VecDeque<ImageId>,
    requests: HashMap<ImageId, ScaleRequest>,
}

struct ScaleShared {
    queue: Mutex<ScaleQueue>,
    available: Condvar,
    shutdown: AtomicBool,
    completed: AtomicU64,
}

impl ScaleShared {
    fn lock(&self) -> MutexGuard<'_, ScaleQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a job is queued or the pipeline shuts down
    fn wait_for_job(&self) -> Option<(ImageId, Arc<Pixmap>, (f32, f32))> {
        let mut queue = self.lock();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }

            while let Some(id) = queue.pending.pop_front() {
                let job = queue
                    .requests
                    .get(&id)
                    .and_then(|request| request.src.clone().map(|src| (id, src, request.scale)));
                if job.is_some() {
                    return job;
                }
            }

            // Wait with timeout to check shutdown
            let (guard, _) = self
                .available
                .wait_timeout(queue, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }
}

fn worker_loop(shared: Arc<ScaleShared>, ready: Sender<ImageId>) {
    while let Some((id, src, scale)) = shared.wait_for_job() {
        let scaled = scale_pixmap(&src, scale);
        drop(src);

        {
            let mut queue = shared.lock();
            let requeued = queue.pending.contains(&id);
            if let Some(request) = queue.requests.get_mut(&id) {
                // A stop or a new factor while we ran makes this result stale
                if let Some(dst) = scaled {
                    if request.scale == scale && !requeued && !request.stopped {
                        request.dst = Some(Arc::new(dst));
                        request.done = true;
                        request.src = None;
                    }
                }
            }
        }

        shared.completed.fetch_add(1, Ordering::Relaxed);
        if ready.try_send(id).is_err() {
            break;
        }
    }
}

/// Resample premultiplied pixels by `scale` with a triangle filter
pub fn scale_pixmap(src: &Pixmap, scale: (f32, f32)) -> Option<Pixmap> {
    let width = ((src.width() as f32 * scale.0).round() as u32).max(1);
    let height = ((src.height() as f32 * scale.1).round() as u32).max(1);

    let image = image::RgbaImage::from_raw(src.width(), src.height(), src.data().to_vec())?;
    let resized = imageops::resize(&image, width, height, FilterType::Triangle);
    Pixmap::from_vec(resized.into_raw(), IntSize::from_wh(width, height)?)
}

/// Background downscaler shared by all images of one service set
pub struct DownscalePipeline {
    shared: Arc<ScaleShared>,
    worker: RefCell<Option<JoinHandle<()>>>,
    ready_tx: Sender<ImageId>,
    ready_rx: Receiver<ImageId>,
    targets: RefCell<HashMap<ImageId, Weak<dyn ScaleTarget>>>,
    host: OwnerLoop,
    /// The owner-side drain task is running
    draining: Cell<bool>,
    me: Weak<DownscalePipeline>,
}

impl DownscalePipeline {
    pub fn new(host: OwnerLoop) -> Rc<Self> {
        let (ready_tx, ready_rx) = channel::unbounded();
        Rc::new_cyclic(|me| Self {
            shared: Arc::new(ScaleShared {
                queue: Mutex::new(ScaleQueue::default()),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                completed: AtomicU64::new(0),
            }),
            worker: RefCell::new(None),
            ready_tx,
            ready_rx,
            targets: RefCell::new(HashMap::new()),
            host,
            draining: Cell::new(false),
            me: me.clone(),
        })
    }

    /// Queue a job scaling `src` by `scale`, replacing any previous factor
    ///
    /// Returns true if the caller must lock the source frame; the lock is
    /// handed back through [`ScaleTarget::scale_ready`] or [`Self::stop`].
    pub(crate) fn request_scale(
        &self,
        id: ImageId,
        target: &Weak<dyn ScaleTarget>,
        src: Arc<Pixmap>,
        src_rect: IntRect,
        scale: (f32, f32),
    ) -> bool {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return false;
        }

        let lock_source = {
            let mut queue = self.shared.lock();
            let request = queue.requests.entry(id).or_insert_with(ScaleRequest::new);
            request.scale = scale;
            request.src = Some(src);
            request.src_rect = src_rect;
            request.dst = None;
            request.done = false;
            request.stopped = false;
            let lock_source = !request.src_locked;
            request.src_locked = true;
            if !queue.pending.contains(&id) {
                queue.pending.push_back(id);
            }
            lock_source
        };
        self.targets.borrow_mut().insert(id, target.clone());

        self.ensure_worker();
        self.ensure_draining();
        self.shared.available.notify_one();
        tracing::debug!("queued downscale of image {} by {:?}", id, scale);
        lock_source
    }

    /// State of the scaled frame for `scale`
    pub fn lookup(&self, id: ImageId, scale: (f32, f32)) -> ScaleLookup {
        let queue = self.shared.lock();
        let Some(request) = queue.requests.get(&id) else {
            return ScaleLookup::Absent;
        };
        if request.stopped || request.scale != scale {
            return ScaleLookup::Absent;
        }
        match (&request.dst, request.done) {
            (Some(dst), true) => ScaleLookup::Ready(dst.clone()),
            _ if request.src.is_some() => ScaleLookup::InFlight,
            _ => ScaleLookup::Absent,
        }
    }

    /// Cancel the job of an image and drop any finished result
    ///
    /// Safe to call any number of times. Returns true if the caller must
    /// unlock the source frame now; a job already running keeps its lock
    /// until the owner thread sees it come back.
    pub fn stop(&self, id: ImageId) -> bool {
        let mut queue = self.shared.lock();
        let queued = queue.pending.contains(&id);
        if queued {
            queue.pending.retain(|&pending| pending != id);
        }
        let Some(request) = queue.requests.get_mut(&id) else {
            return false;
        };

        let mut unlock = false;
        if request.src_locked && (queued || request.done || request.src.is_none()) {
            request.src_locked = false;
            unlock = true;
        }
        if queued {
            request.src = None;
        }
        request.release_result();
        request.stopped = true;
        unlock
    }

    /// Drop the request record of an image
    pub fn forget(&self, id: ImageId) {
        {
            let mut queue = self.shared.lock();
            queue.pending.retain(|&pending| pending != id);
            queue.requests.remove(&id);
        }
        self.targets.borrow_mut().remove(&id);
    }

    /// Number of jobs waiting for the background thread
    pub fn queued(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn stats(&self) -> DownscaleStats {
        let queue = self.shared.lock();
        DownscaleStats {
            queued: queue.pending.len(),
            tracked: queue.requests.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            worker_running: self.worker.borrow().is_some(),
        }
    }

    /// Stop and join the background thread
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        self.ready_tx.close();
        if let Some(worker) = self.worker.borrow_mut().take() {
            let _ = worker.join();
            tracing::debug!("image scaler thread stopped");
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.borrow_mut();
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let ready = self.ready_tx.clone();
        match thread::Builder::new()
            .name("fos-image-scaler".to_string())
            .spawn(move || worker_loop(shared, ready))
        {
            Ok(handle) => {
                tracing::debug!("image scaler thread started");
                *worker = Some(handle);
            }
            Err(e) => tracing::warn!("failed to spawn image scaler thread: {}", e),
        }
    }

    fn ensure_draining(&self) {
        if self.draining.replace(true) {
            return;
        }
        let me = self.me.clone();
        let ready = self.ready_rx.clone();
        self.host.spawn(async move {
            while let Ok(id) = ready.recv().await {
                let Some(pipeline) = me.upgrade() else {
                    break;
                };
                pipeline.finish_job(id);
            }
        });
    }

    /// Owner-thread half of a completed job
    fn finish_job(&self, id: ImageId) {
        let (unlock_source, changed) = {
            let mut queue = self.shared.lock();
            let requeued = queue.pending.contains(&id);
            let Some(request) = queue.requests.get_mut(&id) else {
                return;
            };

            let mut unlock = false;
            if request.src_locked && !requeued {
                request.src_locked = false;
                unlock = true;
            }
            if request.stopped {
                request.release_result();
            }
            let changed = request.done.then_some(request.src_rect);
            (unlock, changed)
        };

        let target = self.targets.borrow().get(&id).and_then(Weak::upgrade);
        if let Some(target) = target {
            target.scale_ready(unlock_source, changed);
        }
    }
}

impl Drop for DownscalePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DownscalePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownscalePipeline")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pipeline statistics
#[derive(Debug, Clone)]
pub struct DownscaleStats {
    pub queued: usize,
    pub tracked: usize,
    pub completed: u64,
    pub worker_running: bool,
}
