//! In-process tier for decoded images.
//!
//! Bounded by entry count and by an approximate byte cost. Eviction is least
//! recently used first; `get` counts as a use.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::{config::MemoryCacheLimits, cover::CoverImage, key::CacheKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub entries: usize,
    pub cost_bytes: u64,
    pub evictions: u64,
}

struct Entry {
    image: CoverImage,
    cost: u64,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    total_cost: u64,
    evictions: u64,
}

pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    max_cost: u64,
}

impl MemoryImageCache {
    pub fn new(limits: MemoryCacheLimits) -> Self {
        let cap = NonZeroUsize::new(limits.max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                total_cost: 0,
                evictions: 0,
            }),
            max_cost: limits.max_cost.as_bytes(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CoverImage> {
        self.inner.lock().entries.get(key).map(|e| e.image.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn put(&self, key: CacheKey, image: CoverImage) {
        let cost = image.cost().as_bytes();
        if self.max_cost > 0 && cost > self.max_cost {
            log::debug!(
                "memory image cache skipped oversized entry; key={}, cost={}",
                key,
                image.cost()
            );
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        // `push` hands back either the replaced value for this key or the
        // entry evicted by the count bound.
        if let Some((old_key, old)) = inner.entries.push(key.clone(), Entry {
            image,
            cost,
        }) {
            inner.total_cost = inner.total_cost.saturating_sub(old.cost);
            if old_key != key {
                inner.evictions += 1;
            }
        }
        inner.total_cost = inner.total_cost.saturating_add(cost);

        while self.max_cost > 0 && inner.total_cost > self.max_cost {
            let Some((_, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_cost = inner.total_cost.saturating_sub(evicted.cost);
            inner.evictions += 1;
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
                true
            }
            None => false,
        }
    }

    /// Drop every variant cached for one address.
    pub fn remove_address(&self, address: &str) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.address() == address)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            if let Some(entry) = inner.entries.pop(key) {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
            }
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
    }

    /// System memory-pressure hook: drop everything.
    pub fn handle_memory_pressure(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            let n = inner.entries.len();
            inner.entries.clear();
            inner.total_cost = 0;
            n
        };
        log::info!(
            "memory image cache dropped {dropped} entries under pressure"
        );
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let inner = self.inner.lock();
        MemoryCacheStats {
            entries: inner.entries.len(),
            cost_bytes: inner.total_cost,
            evictions: inner.evictions,
        }
    }
}

impl std::fmt::Debug for MemoryImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemoryImageCache")
            .field("entries", &stats.entries)
            .field("cost_bytes", &stats.cost_bytes)
            .field("max_cost", &self.max_cost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key::{Locator, TransformSpec},
        units::ByteSize,
    };
    use image::{DynamicImage, RgbaImage};

    fn key(n: u32) -> CacheKey {
        let url = format!("https://img.example.com/{n}.png");
        let loc = Locator::parse(&url).unwrap();
        CacheKey::processed(&loc, &TransformSpec::points(100, 2))
    }

    // 10x10 RGBA = 400 bytes of cost.
    fn small() -> CoverImage {
        CoverImage::new(DynamicImage::ImageRgba8(RgbaImage::new(10, 10)))
    }

    fn cache(max_entries: usize, max_cost: u64) -> MemoryImageCache {
        MemoryImageCache::new(MemoryCacheLimits {
            max_entries,
            max_cost: ByteSize::from_bytes(max_cost),
        })
    }

    #[test]
    fn put_then_get_returns_same_handle() {
        let cache = cache(10, 10_000);
        let img = small();
        cache.put(key(1), img.clone());
        let hit = cache.get(&key(1)).unwrap();
        assert!(hit.ptr_eq(&img));
        assert!(cache.get(&key(2)).is_none());
    }

    #[test]
    fn count_bound_evicts_least_recently_used() {
        let cache = cache(2, 10_000);
        cache.put(key(1), small());
        cache.put(key(2), small());
        let _ = cache.get(&key(1));
        cache.put(key(3), small());

        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().cost_bytes, 800);
    }

    #[test]
    fn cost_bound_is_never_exceeded() {
        let cache = cache(100, 1_000);
        for n in 0..5 {
            cache.put(key(n), small());
            assert!(cache.stats().cost_bytes <= 1_000);
        }
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.contains(&key(4)));
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn replacing_a_key_does_not_double_count() {
        let cache = cache(10, 10_000);
        cache.put(key(1), small());
        cache.put(key(1), small());
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().cost_bytes, 400);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn oversized_entry_is_skipped() {
        let cache = cache(10, 100);
        cache.put(key(1), small());
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn remove_address_drops_all_variants() {
        let cache = cache(10, 10_000);
        let loc = Locator::parse("https://img.example.com/a.png").unwrap();
        for spec in [TransformSpec::points(1, 2), TransformSpec::pixels(1, 2)] {
            cache.put(CacheKey::processed(&loc, &spec), small());
        }
        cache.put(key(9), small());

        assert_eq!(cache.remove_address(loc.address()), 2);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().cost_bytes, 400);
    }

    #[test]
    fn memory_pressure_drops_everything() {
        let cache = cache(10, 10_000);
        cache.put(key(1), small());
        cache.put(key(2), small());
        cache.handle_memory_pressure();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().cost_bytes, 0);
    }
}
