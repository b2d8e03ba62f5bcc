//! The consumer-facing entry point.
//!
//! [`ImagePipeline`] owns the memory tier, the disk tier, the transport and
//! the coalescer. A load walks the tiers in order:
//!
//! 1. memory, by processed key
//! 2. disk, processed image (promoted into memory)
//! 3. disk, original bytes (downsampled, then stored as processed)
//! 4. network (original bytes persisted, then as in 3)
//!
//! Loads that report progress stream the body directly and skip both the
//! coalescer and the retry loop.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DiskCacheLimits, PipelineConfig, TaskPriority},
    cover::CoverImage,
    disk::{DiskCacheStatsSnapshot, DiskImageCache},
    downsample::downsample,
    error::{DecodeError, LoadError, NetworkError},
    fetch::{
        CoalescerStats, HttpTransport, ImageTransport, RequestCoalescer,
        RetryPolicy,
    },
    key::{CacheKey, ImageRequest, Locator, TransformSpec},
    loader::{ImageLoader, LoadHandle},
    memory::{MemoryCacheStats, MemoryImageCache},
    units::ByteSize,
};

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

pub(crate) type ProgressFn = dyn Fn(f64) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub memory: MemoryCacheStats,
    pub disk: DiskCacheStatsSnapshot,
    pub coalescer: CoalescerStats,
}

/// Cheaply cloneable handle; clones share every tier.
#[derive(Clone)]
pub struct ImagePipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    runtime: Handle,
    memory: MemoryImageCache,
    disk: DiskImageCache,
    transport: Arc<dyn ImageTransport>,
    coalescer: RequestCoalescer,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.coalescer.shutdown();
    }
}

impl ImagePipeline {
    /// HTTP transport and the configured (or platform default) cache dir.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.http)
            .context("Failed to build HTTP client")?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: PipelineConfig,
        transport: Arc<dyn ImageTransport>,
    ) -> anyhow::Result<Self> {
        let root = config.resolve_cache_dir()?;
        let disk = DiskImageCache::open(root.clone(), config.disk)
            .with_context(|| {
                format!("Failed to open image cache at {}", root.display())
            })?;
        Self::with_parts(config, transport, disk)
    }

    /// Assemble from an already opened disk tier.
    pub fn with_parts(
        config: PipelineConfig,
        transport: Arc<dyn ImageTransport>,
        disk: DiskImageCache,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .context("ImagePipeline must be created inside a tokio runtime")?;
        let policy = RetryPolicy::from_config(&config);
        let coalescer = RequestCoalescer::new(Arc::clone(&transport), policy);
        log::debug!(
            "image pipeline ready; cache_dir={}, retries={}, \
             memory_entries={}",
            disk.root().display(),
            config.retry_count,
            config.memory.max_entries
        );
        Ok(Self {
            inner: Arc::new(Inner {
                memory: MemoryImageCache::new(config.memory),
                config,
                runtime,
                disk,
                transport,
                coalescer,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &MemoryImageCache {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskImageCache {
        &self.inner.disk
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Start loading `request`; the handle yields its phases.
    pub fn load(&self, request: ImageRequest) -> LoadHandle {
        self.start(request, false)
    }

    /// Like [`Self::load`], with `Progress` phases while downloading.
    pub fn load_with_progress(&self, request: ImageRequest) -> LoadHandle {
        self.start(request, true)
    }

    fn start(
        &self,
        request: ImageRequest,
        report_progress: bool,
    ) -> LoadHandle {
        let loader = self.loader().with_progress(report_progress);
        loader.update(request);
        LoadHandle::new(loader)
    }

    /// A re-targetable loader for one display slot.
    pub fn loader(&self) -> ImageLoader {
        ImageLoader::new(self.clone())
    }

    /// Warm the caches for `locators`, one at a time.
    ///
    /// Failures are logged and skipped. Returns how many images ended up
    /// cached.
    pub async fn prefetch<I>(
        &self,
        locators: I,
        spec: TransformSpec,
        cancel: &CancellationToken,
    ) -> usize
    where
        I: IntoIterator<Item = Locator>,
    {
        let mut warmed = 0usize;
        for locator in locators {
            if cancel.is_cancelled() {
                log::debug!("image prefetch cancelled; warmed={warmed}");
                break;
            }
            let request = ImageRequest::new(locator, spec);
            match self.resolve(&request, cancel, None).await {
                Some(Ok(_)) => warmed += 1,
                Some(Err(e)) => log::debug!(
                    "image prefetch skipped; url={}, err={}",
                    request.locator.address(),
                    e
                ),
                None => break,
            }
            if self.inner.config.task_priority == TaskPriority::Background {
                tokio::task::yield_now().await;
            }
        }
        warmed
    }

    /// Drop every cached copy of `locator`: the original bytes and all
    /// processed variants, in memory and on disk.
    ///
    /// `spec` names one variant explicitly; it is removed even if the disk
    /// tier never recorded it.
    pub async fn invalidate(
        &self,
        locator: &Locator,
        spec: Option<&TransformSpec>,
    ) {
        let address = locator.address();
        let dropped = self.inner.memory.remove_address(address);
        let files = self.inner.disk.remove_address(address).await;
        if let Some(spec) = spec {
            let key = CacheKey::processed(locator, spec);
            self.inner.disk.remove(&key).await;
        }
        log::debug!(
            "image invalidated; url={address}, memory_entries={dropped}, \
             disk_files={files}"
        );
    }

    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    pub async fn clear_disk(&self) {
        self.inner.disk.remove_all().await;
    }

    pub async fn clear_all(&self) {
        self.clear_memory();
        self.clear_disk().await;
    }

    pub async fn configure_disk_cache(&self, ttl: Duration, max_size_mb: u64) {
        self.inner
            .disk
            .configure(DiskCacheLimits {
                ttl,
                max_bytes: ByteSize::from_mib(max_size_mb),
            })
            .await;
    }

    pub fn handle_memory_pressure(&self) {
        self.inner.memory.handle_memory_pressure();
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            memory: self.inner.memory.stats(),
            disk: self.inner.disk.stats_snapshot(),
            coalescer: self.inner.coalescer.stats(),
        }
    }

    /// Walk the tiers for one request. `None` means `cancel` fired first.
    pub(crate) async fn resolve(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> Option<Result<CoverImage, LoadError>> {
        let inner = &self.inner;
        let processed_key = request.processed_key();
        let original_key = request.original_key();

        if let Some(hit) = inner.memory.get(&processed_key) {
            return Some(Ok(hit));
        }

        if let Some(hit) = inner.disk.load_image(&processed_key).await {
            inner.memory.put(processed_key, hit.clone());
            return Some(Ok(hit));
        }
        if cancel.is_cancelled() {
            return None;
        }

        if let Some(original) = inner.disk.load_data(&original_key).await {
            if cancel.is_cancelled() {
                return None;
            }
            match downsample(original, request.spec).await {
                Some(image) => {
                    return self
                        .keep_processed(processed_key, image, cancel)
                        .await;
                }
                None => log::warn!(
                    "cached original undecodable, refetching; url={}",
                    request.locator.address()
                ),
            }
        }
        if cancel.is_cancelled() {
            return None;
        }

        let fetched = match progress {
            Some(report) => {
                self.fetch_streaming(&request.locator, cancel, report).await
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    res = inner.coalescer.fetch(&request.locator) => res,
                }
            }
        };
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) if e.is_cancelled() => return None,
            Err(e) => return Some(Err(e.into())),
        };

        inner.disk.store_data(&bytes, &original_key).await;
        if cancel.is_cancelled() {
            return None;
        }

        match downsample(bytes, request.spec).await {
            Some(image) => {
                self.keep_processed(processed_key, image, cancel).await
            }
            None => Some(Err(DecodeError(format!(
                "undecodable image data from {}",
                request.locator.address()
            ))
            .into())),
        }
    }

    async fn keep_processed(
        &self,
        key: CacheKey,
        image: CoverImage,
        cancel: &CancellationToken,
    ) -> Option<Result<CoverImage, LoadError>> {
        if cancel.is_cancelled() {
            return None;
        }
        self.inner.disk.store_image(&image, &key).await;
        self.inner.memory.put(key, image.clone());
        Some(Ok(image))
    }

    /// Single attempt, reporting the received fraction when the length is
    /// known.
    async fn fetch_streaming(
        &self,
        locator: &Locator,
        cancel: &CancellationToken,
        report: &ProgressFn,
    ) -> Result<Bytes, NetworkError> {
        let cancelled =
            || NetworkError::Cancelled(locator.address().to_string());

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            res = self.inner.transport.stream(locator) => res?,
        };

        let expected = body.content_length;
        let mut buf = BytesMut::with_capacity(
            expected.map_or(0, |len| len.min(MAX_PREALLOC) as usize),
        );
        if expected.is_some() {
            report(0.0);
        }

        let mut chunks = body.chunks;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            buf.extend_from_slice(&chunk?);
            if let Some(total) = expected {
                report((buf.len() as f64 / total as f64).min(1.0));
            }
        }

        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("coalescer", &self.inner.coalescer)
            .finish()
    }
}
