//! Per-slot load state machine.
//!
//! An [`ImageLoader`] publishes [`LoadPhase`]s on a `watch` channel:
//! `Empty`, then any number of `Progress`, then `Success` or `Failure`.
//! Retargeting with [`ImageLoader::update`] cancels the running work and
//! starts over; results from superseded work are discarded.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::{
    cover::CoverImage,
    error::LoadError,
    key::{CacheKey, ImageRequest},
    pipeline::{ImagePipeline, ProgressFn},
};

#[derive(Debug, Clone)]
pub enum LoadPhase {
    Empty,
    /// Fraction of the body received, `0.0..=1.0`.
    Progress(f64),
    Success(CoverImage),
    Failure(LoadError),
}

impl LoadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadPhase::Success(_) | LoadPhase::Failure(_))
    }

    pub fn image(&self) -> Option<&CoverImage> {
        match self {
            LoadPhase::Success(image) => Some(image),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&LoadError> {
        match self {
            LoadPhase::Failure(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Slot {
    current: Option<CacheKey>,
    /// Bumped on every retarget; work may publish only under its own value.
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct Shared {
    phase: watch::Sender<LoadPhase>,
    slot: Mutex<Slot>,
}

impl Shared {
    /// Publish unless the work was cancelled or superseded.
    fn publish(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        phase: LoadPhase,
    ) -> bool {
        let slot = self.slot.lock();
        if cancel.is_cancelled() || slot.generation != generation {
            return false;
        }
        self.phase.send_replace(phase);
        true
    }
}

pub struct ImageLoader {
    pipeline: ImagePipeline,
    shared: Arc<Shared>,
    report_progress: bool,
}

impl ImageLoader {
    pub(crate) fn new(pipeline: ImagePipeline) -> Self {
        let (phase, _) = watch::channel(LoadPhase::Empty);
        Self {
            pipeline,
            shared: Arc::new(Shared {
                phase,
                slot: Mutex::new(Slot::default()),
            }),
            report_progress: false,
        }
    }

    /// Stream the body and emit `Progress` phases on network loads.
    pub fn with_progress(mut self, report_progress: bool) -> Self {
        self.report_progress = report_progress;
        self
    }

    pub fn phase(&self) -> LoadPhase {
        self.shared.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadPhase> {
        self.shared.phase.subscribe()
    }

    /// Point the loader at `request`.
    ///
    /// Same processed key as the current target: nothing happens. Otherwise
    /// running work is cancelled, the phase resets to `Empty`, and a memory
    /// hit is published immediately; anything else loads in the background.
    pub fn update(&self, request: ImageRequest) {
        let key = request.processed_key();
        let (generation, cancel) = {
            let mut slot = self.shared.slot.lock();
            if slot.current.as_ref() == Some(&key) {
                return;
            }
            if let Some(previous) = slot.cancel.take() {
                previous.cancel();
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.current = Some(key.clone());
            self.shared.phase.send_replace(LoadPhase::Empty);

            if let Some(hit) = self.pipeline.memory().get(&key) {
                self.shared.phase.send_replace(LoadPhase::Success(hit));
                return;
            }

            let cancel = CancellationToken::new();
            slot.cancel = Some(cancel.clone());
            (slot.generation, cancel)
        };

        log::debug!("image load started; key={}", key);
        let pipeline = self.pipeline.clone();
        let shared = Arc::clone(&self.shared);
        let report_progress = self.report_progress;
        self.pipeline.runtime().spawn(async move {
            let progress_sink = {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                move |fraction: f64| {
                    let phase = LoadPhase::Progress(fraction);
                    shared.publish(generation, &cancel, phase);
                }
            };
            let progress: Option<&ProgressFn> = if report_progress {
                Some(&progress_sink)
            } else {
                None
            };

            let resolved = pipeline.resolve(&request, &cancel, progress).await;
            let phase = match resolved {
                Some(Ok(image)) => LoadPhase::Success(image),
                Some(Err(err)) => {
                    log::warn!("image load failed; key={}, err={}", key, err);
                    LoadPhase::Failure(err)
                }
                None => return,
            };
            if !shared.publish(generation, &cancel, phase) {
                log::debug!("image load result discarded; key={}", key);
            }
        });
    }

    /// Token of the work still allowed to publish, if any.
    fn active_run(&self) -> Option<CancellationToken> {
        let slot = self.shared.slot.lock();
        slot.cancel.clone().filter(|cancel| !cancel.is_cancelled())
    }

    /// Stop this loader's running work. Shared fetches keep going for other
    /// waiters. The next `update` restarts even with the same request.
    pub fn cancel(&self) {
        let mut slot = self.shared.slot.lock();
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        slot.current = None;
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.slot.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("ImageLoader")
            .field("current", &slot.current)
            .field("generation", &slot.generation)
            .finish()
    }
}

/// The receiving end of a single [`ImagePipeline::load`]. Dropping it
/// cancels the load.
pub struct LoadHandle {
    loader: ImageLoader,
    phases: watch::Receiver<LoadPhase>,
}

impl LoadHandle {
    pub(crate) fn new(loader: ImageLoader) -> Self {
        let phases = loader.subscribe();
        Self { loader, phases }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phases.borrow().clone()
    }

    /// Next published phase; `None` once nothing more can be published.
    pub async fn changed(&mut self) -> Option<LoadPhase> {
        let pending = self.phases.has_changed().unwrap_or(false);
        if !pending && !self.next_change().await {
            return None;
        }
        Some(self.phases.borrow_and_update().clone())
    }

    /// Wait for `Success` or `Failure`.
    ///
    /// Returns early with the last published phase when the load is
    /// cancelled before finishing.
    pub async fn wait(&mut self) -> LoadPhase {
        loop {
            {
                let phase = self.phases.borrow_and_update();
                if phase.is_terminal() {
                    return phase.clone();
                }
            }
            if !self.next_change().await {
                return self.phases.borrow().clone();
            }
        }
    }

    /// `false` once no running work is left to publish.
    async fn next_change(&mut self) -> bool {
        let Some(run) = self.loader.active_run() else {
            return false;
        };
        tokio::select! {
            changed = self.phases.changed() => changed.is_ok(),
            _ = run.cancelled() => self.loader.active_run().is_some(),
        }
    }

    pub fn cancel(&self) {
        self.loader.cancel();
    }

    /// The current phase followed by every later one.
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = LoadPhase> + Send + 'static {
        let LoadHandle { loader, phases } = self;
        WatchStream::new(phases).map(move |phase| {
            let _keep_alive = &loader;
            phase
        })
    }
}

impl std::fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("loader", &self.loader)
            .field("phase", &*self.phases.borrow())
            .finish()
    }
}
