//! Persistent tier: one file per cache key under a root directory.
//!
//! File names are the SHA-256 of the rendered key, suffixed `.bin` for raw
//! downloaded bytes and `.img` for re-encoded processed images. A file's
//! modification time is its last use; reads refresh it. Entries idle longer
//! than the TTL read as misses and are deleted. After every write the
//! directory is trimmed oldest-first back under the byte budget.
//!
//! Processed files written for an address are recorded in a small
//! persisted index so [`DiskImageCache::remove_address`] can find all of
//! them.
//!
//! Every operation holds the index lock for its full duration, so
//! operations are serialized. I/O failures are logged and surface only as
//! misses.

mod clock;
mod eviction;
mod stats;
mod variant_index;

pub use clock::{Clock, ManualClock, SystemClock};
pub use stats::DiskCacheStatsSnapshot;

use std::{
    collections::HashSet,
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use filetime::FileTime;
use image::{DynamicImage, ImageFormat, codecs::jpeg::JpegEncoder};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::{
    config::DiskCacheLimits,
    constants::disk,
    cover::CoverImage,
    error::{StorageError, StorageResult},
    key::{CacheKey, KeyDigest},
    units::ByteSize,
};
use eviction::{CacheEntryInfo, EvictionReason, is_expired, plan_evictions};
use stats::DiskCacheStats;
use variant_index::VariantIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// Downloaded bytes, stored as received.
    Data,
    /// Processed image, re-encoded as PNG or JPEG.
    Image,
}

impl EntryKind {
    fn extension(self) -> &'static str {
        match self {
            EntryKind::Data => "bin",
            EntryKind::Image => "img",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "bin" => Some(EntryKind::Data),
            "img" => Some(EntryKind::Image),
            _ => None,
        }
    }
}

pub struct DiskImageCache {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    ttl_ms: AtomicU64,
    max_bytes: AtomicU64,
    index: Mutex<VariantIndex>,
    stats: DiskCacheStats,
}

impl DiskImageCache {
    pub fn open(
        root: PathBuf,
        limits: DiskCacheLimits,
    ) -> anyhow::Result<Self> {
        Self::open_with_clock(root, limits, Arc::new(SystemClock))
    }

    /// Create the root if needed and sweep it: stray temp files, expired
    /// entries, then oldest entries while over budget.
    pub fn open_with_clock(
        root: PathBuf,
        limits: DiskCacheLimits,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let limits = limits.clamped();
        ensure_root_sync(&root)?;

        if let Err(e) = startup_sweep_sync(&root, &limits, clock.now()) {
            log::warn!(
                "disk image cache init sweep failed; root={}, err={e}",
                root.display()
            );
        }

        let index = load_index_sync(&root);

        Ok(Self {
            root,
            clock,
            ttl_ms: AtomicU64::new(duration_ms(limits.ttl)),
            max_bytes: AtomicU64::new(limits.max_bytes.as_bytes()),
            index: Mutex::new(index),
            stats: DiskCacheStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> DiskCacheLimits {
        DiskCacheLimits {
            ttl: Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed)),
            max_bytes: ByteSize::from_bytes(
                self.max_bytes.load(Ordering::Relaxed),
            ),
        }
    }

    /// Replace TTL and budget (floors applied), then trim to the new budget.
    pub async fn configure(&self, limits: DiskCacheLimits) {
        let limits = limits.clamped();
        let mut index = self.index.lock().await;
        self.ttl_ms.store(duration_ms(limits.ttl), Ordering::SeqCst);
        self.max_bytes
            .store(limits.max_bytes.as_bytes(), Ordering::SeqCst);
        log::debug!(
            "disk image cache limits updated; ttl={:?}, max_bytes={}",
            limits.ttl,
            limits.max_bytes
        );
        self.trim_locked(&mut index).await;
    }

    pub async fn load_data(&self, key: &CacheKey) -> Option<Bytes> {
        let _index = self.index.lock().await;
        self.read_entry(key, EntryKind::Data).await.map(Bytes::from)
    }

    /// A stored processed image; an undecodable file is removed and
    /// reported as a miss.
    pub async fn load_image(&self, key: &CacheKey) -> Option<CoverImage> {
        let _index = self.index.lock().await;
        let raw = self.read_entry(key, EntryKind::Image).await?;

        match tokio::task::spawn_blocking(move || image::load_from_memory(&raw))
            .await
        {
            Ok(Ok(img)) => Some(CoverImage::new(img)),
            Ok(Err(e)) => {
                log::warn!(
                    "disk image cache decode failed; key={}, err={e}",
                    key
                );
                let path = self.entry_path(key, EntryKind::Image);
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
            Err(e) => {
                log::warn!("disk image cache decode join failed: {e}");
                None
            }
        }
    }

    pub async fn store_data(&self, bytes: &[u8], key: &CacheKey) {
        let mut index = self.index.lock().await;
        self.write_entry(key, EntryKind::Data, bytes).await;
        self.trim_locked(&mut index).await;
    }

    /// PNG when the image carries alpha, JPEG otherwise.
    pub async fn store_image(&self, image: &CoverImage, key: &CacheKey) {
        let encoded = {
            let image = image.clone();
            tokio::task::spawn_blocking(move || {
                encode_for_disk(image.as_dynamic())
            })
            .await
        };
        let bytes = match encoded {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                self.stats.on_write_error();
                log::warn!(
                    "disk image cache encode failed; key={}, err={e}",
                    key
                );
                return;
            }
            Err(e) => {
                self.stats.on_write_error();
                log::warn!("disk image cache encode join failed: {e}");
                return;
            }
        };

        let mut index = self.index.lock().await;
        let written = self.write_entry(key, EntryKind::Image, &bytes).await;
        if written
            && let CacheKey::Processed { address, .. } = key
            && index.record(original_digest(address), key.digest())
        {
            self.persist_index(&index).await;
        }
        self.trim_locked(&mut index).await;
    }

    /// Delete both the data and the image file for `key`.
    pub async fn remove(&self, key: &CacheKey) {
        let mut index = self.index.lock().await;
        self.remove_files(&key.digest()).await;
        if let CacheKey::Processed { address, .. } = key
            && index.forget(&original_digest(address), &key.digest())
        {
            self.persist_index(&index).await;
        }
    }

    /// Delete the original and every processed variant stored for
    /// `address`. Returns how many files were removed.
    pub async fn remove_address(&self, address: &str) -> usize {
        let mut index = self.index.lock().await;
        let original = original_digest(address);
        let variants = index.take(&original);

        let mut removed = self.remove_files(&original).await;
        for processed in &variants {
            removed += self.remove_files(processed).await;
        }
        if !variants.is_empty() {
            self.persist_index(&index).await;
        }
        log::debug!(
            "disk image cache address removed; address={address}, \
             variants={}, files={removed}",
            variants.len()
        );
        removed
    }

    pub async fn remove_all(&self) {
        let mut index = self.index.lock().await;
        index.clear();
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "disk image cache clear failed; root={}, err={e}",
                self.root.display()
            ),
        }
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || ensure_root_sync(&root)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!(
                "disk image cache root recreate failed; root={}, err={e}",
                self.root.display()
            ),
            Err(e) => {
                log::warn!("disk image cache root recreate join failed: {e}")
            }
        }
        log::info!("disk image cache cleared; root={}", self.root.display());
    }

    /// Trim to the byte budget now.
    pub async fn trim(&self) {
        let mut index = self.index.lock().await;
        self.trim_locked(&mut index).await;
    }

    /// Bytes currently held in entry files.
    pub async fn usage_bytes(&self) -> ByteSize {
        let _index = self.index.lock().await;
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || scan_sync(&root)).await {
            Ok(Ok(scan)) => ByteSize::from_bytes(
                scan.entries.iter().map(|e| e.size_bytes).sum(),
            ),
            Ok(Err(e)) => {
                log::warn!("disk image cache usage scan failed: {e}");
                ByteSize::ZERO
            }
            Err(e) => {
                log::warn!("disk image cache usage scan join failed: {e}");
                ByteSize::ZERO
            }
        }
    }

    pub fn stats_snapshot(&self) -> DiskCacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn entry_path(&self, key: &CacheKey, kind: EntryKind) -> PathBuf {
        self.digest_path(&key.digest(), kind)
    }

    fn digest_path(&self, digest: &KeyDigest, kind: EntryKind) -> PathBuf {
        self.root
            .join(format!("{}.{}", digest.to_hex(), kind.extension()))
    }

    /// Both files for one digest; returns how many existed.
    async fn remove_files(&self, digest: &KeyDigest) -> usize {
        let mut removed = 0;
        for kind in [EntryKind::Data, EntryKind::Image] {
            let path = self.digest_path(digest, kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "disk image cache remove failed; path={}, err={e}",
                    path.display()
                ),
            }
        }
        removed
    }

    async fn persist_index(&self, index: &VariantIndex) {
        let bytes = index.serialize();
        if let Err(e) = self.write_atomic(index.path(), &bytes).await {
            log::warn!(
                "disk image cache index write failed; path={}, err={e}",
                index.path().display()
            );
        }
    }

    async fn read_entry(
        &self,
        key: &CacheKey,
        kind: EntryKind,
    ) -> Option<Vec<u8>> {
        let path = self.entry_path(key, kind);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!(
                        "disk image cache stat failed; key={}, err={e}",
                        key
                    );
                }
                self.stats.on_miss();
                return None;
            }
        };

        let now = self.clock.now();
        let ttl = Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed));
        if let Ok(modified) = meta.modified()
            && is_expired(now, modified, ttl)
        {
            log::debug!("disk image cache entry expired; key={}", key);
            let _ = tokio::fs::remove_file(&path).await;
            self.stats.on_expired();
            return None;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "disk image cache read failed; key={}, err={e}",
                    key
                );
                self.stats.on_miss();
                return None;
            }
        };

        if let Err(e) = stamp_mtime(path, now).await {
            log::debug!(
                "disk image cache touch failed; key={}, err={e}",
                key
            );
        }
        self.stats.on_hit();
        Some(bytes)
    }

    async fn write_entry(
        &self,
        key: &CacheKey,
        kind: EntryKind,
        bytes: &[u8],
    ) -> bool {
        let path = self.entry_path(key, kind);
        let written = match self.write_atomic(&path, bytes).await {
            Ok(()) => stamp_mtime(path, self.clock.now())
                .await
                .map_err(StorageError::from),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                self.stats.on_write();
                log::debug!(
                    "disk image cache stored; key={}, bytes={}",
                    key,
                    bytes.len()
                );
                true
            }
            Err(e) => {
                self.stats.on_write_error();
                log::warn!(
                    "disk image cache write failed; key={}, err={e}",
                    key
                );
                false
            }
        }
    }

    async fn write_atomic(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let tmp = self
            .root
            .join(format!("{file_name}.tmp-{}", Uuid::new_v4().simple()));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Size-only pass; expiry is handled lazily by reads and at startup.
    async fn trim_locked(&self, index: &mut VariantIndex) {
        let start = Instant::now();
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        let now = self.clock.now();

        let root = self.root.clone();
        let scanned =
            tokio::task::spawn_blocking(move || scan_sync(&root)).await;
        let scan = match scanned {
            Ok(Ok(scan)) => scan,
            Ok(Err(e)) => {
                log::warn!("disk image cache trim scan failed: {e}");
                return;
            }
            Err(e) => {
                log::warn!("disk image cache trim scan join failed: {e}");
                return;
            }
        };

        let mut present = image_digests(&scan.entries);
        let plan = plan_evictions(scan.entries, now, None, max_bytes);
        if plan.planned.is_empty() {
            return;
        }

        let mut removed = 0u64;
        for eviction in plan.planned {
            match tokio::fs::remove_file(&eviction.path).await {
                Ok(()) => {
                    removed += 1;
                    if let Some(digest) = image_digest(&eviction.path) {
                        present.remove(&digest);
                    }
                }
                Err(e) => log::warn!(
                    "disk image cache eviction failed; path={}, err={e}",
                    eviction.path.display()
                ),
            }
        }
        if index.retain_present(&present) > 0 {
            self.persist_index(index).await;
        }

        let duration_ms =
            start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
        self.stats.on_trim_finished(removed, duration_ms);
        log::info!(
            "disk image cache trim removed {} entries ({} -> {} bytes) in {}ms",
            removed,
            plan.total_bytes_before,
            plan.total_bytes_after,
            duration_ms
        );
    }
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("root", &self.root)
            .field("limits", &self.limits())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Scan {
    entries: Vec<CacheEntryInfo>,
    stray_tmp: Vec<PathBuf>,
}

fn scan_sync(root: &Path) -> io::Result<Scan> {
    let mut scan = Scan::default();
    let dir = match std::fs::read_dir(root) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e),
    };

    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("disk image cache ls entry error: {e}");
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains(".tmp-") {
            scan.stray_tmp.push(path);
            continue;
        }
        let is_entry = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(EntryKind::from_extension)
            .is_some();
        if !is_entry {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                log::warn!(
                    "disk image cache stat failed; path={}, err={e}",
                    path.display()
                );
                continue;
            }
        };
        scan.entries.push(CacheEntryInfo {
            path,
            size_bytes: meta.len(),
            last_modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(scan)
}

/// Digest named by an `.img` file, if `path` is one.
fn image_digest(path: &Path) -> Option<KeyDigest> {
    let kind = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(EntryKind::from_extension)?;
    if kind != EntryKind::Image {
        return None;
    }
    KeyDigest::from_hex(path.file_stem()?.to_str()?)
}

fn image_digests(entries: &[CacheEntryInfo]) -> HashSet<KeyDigest> {
    entries.iter().filter_map(|e| image_digest(&e.path)).collect()
}

fn original_digest(address: &str) -> KeyDigest {
    CacheKey::Original {
        address: address.to_string(),
    }
    .digest()
}

fn write_atomic_sync(
    root: &Path,
    path: &Path,
    bytes: &[u8],
) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let tmp =
        root.join(format!("{file_name}.tmp-{}", Uuid::new_v4().simple()));
    if let Err(e) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)
}

/// Load the variant index and drop digests whose file no longer exists.
fn load_index_sync(root: &Path) -> VariantIndex {
    let path = root.join(disk::VARIANT_INDEX_FILE);
    let mut index = VariantIndex::load_or_default(path);
    let scan = match scan_sync(root) {
        Ok(scan) => scan,
        Err(e) => {
            log::warn!(
                "disk image cache index prune scan failed; root={}, err={e}",
                root.display()
            );
            return index;
        }
    };

    let pruned = index.retain_present(&image_digests(&scan.entries));
    if pruned > 0 {
        log::debug!("disk image cache index pruned; stale={pruned}");
        let bytes = index.serialize();
        if let Err(e) = write_atomic_sync(root, index.path(), &bytes) {
            log::warn!("disk image cache index write failed; err={e}");
        }
    }
    index
}

fn ensure_root_sync(root: &Path) -> io::Result<()> {
    std::fs::create_dir_all(root)?;
    let tag = root.join(disk::CACHEDIR_TAG);
    if !tag.exists() {
        std::fs::write(tag, disk::CACHEDIR_TAG_CONTENTS)?;
    }
    Ok(())
}

fn startup_sweep_sync(
    root: &Path,
    limits: &DiskCacheLimits,
    now: SystemTime,
) -> io::Result<()> {
    let scan = scan_sync(root)?;

    for tmp in &scan.stray_tmp {
        if let Err(e) = std::fs::remove_file(tmp) {
            log::warn!(
                "disk image cache init tmp cleanup failed; path={}, err={e}",
                tmp.display()
            );
        }
    }

    let plan = plan_evictions(
        scan.entries,
        now,
        Some(limits.ttl),
        limits.max_bytes.as_bytes(),
    );
    let (mut removed_ttl, mut removed_size) = (0usize, 0usize);
    for eviction in plan.planned {
        if let Err(e) = std::fs::remove_file(&eviction.path) {
            log::warn!(
                "disk image cache init eviction failed; path={}, err={e}",
                eviction.path.display()
            );
            continue;
        }
        match eviction.reason {
            EvictionReason::TtlExpired => removed_ttl += 1,
            EvictionReason::OverSizeCap => removed_size += 1,
        }
    }

    if removed_ttl + removed_size + scan.stray_tmp.len() > 0 {
        log::info!(
            "disk image cache init sweep removed {} entries \
             (ttl={}, size={}) and {} temp files",
            removed_ttl + removed_size,
            removed_ttl,
            removed_size,
            scan.stray_tmp.len()
        );
    }
    Ok(())
}

async fn stamp_mtime(path: PathBuf, at: SystemTime) -> io::Result<()> {
    let mtime = FileTime::from_system_time(at);
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
        .await
        .map_err(io::Error::other)?
}

fn encode_for_disk(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    if image.color().has_alpha() {
        image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    } else {
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(
            &mut out,
            disk::JPEG_QUALITY,
        ))?;
    }
    Ok(out)
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}
