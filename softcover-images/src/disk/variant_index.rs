//! Processed entries known per address.
//!
//! A processed file is named by the digest of address plus transform, so the
//! address alone cannot find it. The index maps each original key's digest
//! to the processed digests written for it and is persisted in the cache
//! root, so invalidation still reaches them after a restart.

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
};

use crate::key::KeyDigest;

type Variants = HashMap<KeyDigest, HashSet<KeyDigest>>;

#[derive(Debug)]
pub(super) struct VariantIndex {
    path: PathBuf,
    variants: Variants,
}

impl VariantIndex {
    const MAGIC: [u8; 8] = *b"SCVIDX01";
    const VERSION: u32 = 1;

    /// Unreadable or foreign files load as an empty index.
    pub fn load_or_default(path: PathBuf) -> Self {
        let variants = match load_file(&path) {
            Ok(variants) => variants,
            Err(e) => {
                log::warn!(
                    "disk image cache index unreadable; path={}, err={e}",
                    path.display()
                );
                HashMap::new()
            }
        };
        Self { path, variants }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.variants.values().map(HashSet::len).sum()
    }

    /// `true` when the pair was not known yet.
    pub fn record(
        &mut self,
        original: KeyDigest,
        processed: KeyDigest,
    ) -> bool {
        self.variants.entry(original).or_default().insert(processed)
    }

    pub fn forget(
        &mut self,
        original: &KeyDigest,
        processed: &KeyDigest,
    ) -> bool {
        let Some(set) = self.variants.get_mut(original) else {
            return false;
        };
        let removed = set.remove(processed);
        if set.is_empty() {
            self.variants.remove(original);
        }
        removed
    }

    /// Remove and return every processed digest recorded for `original`.
    pub fn take(&mut self, original: &KeyDigest) -> Vec<KeyDigest> {
        self.variants
            .remove(original)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.variants.clear();
    }

    /// Drop processed digests whose file is gone. Returns how many.
    pub fn retain_present(&mut self, present: &HashSet<KeyDigest>) -> usize {
        let before = self.len();
        self.variants.retain(|_, set| {
            set.retain(|digest| present.contains(digest));
            !set.is_empty()
        });
        before.saturating_sub(self.len())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.len() * 36);
        out.extend_from_slice(&Self::MAGIC);
        out.extend_from_slice(&Self::VERSION.to_le_bytes());
        out.extend_from_slice(&(self.variants.len() as u32).to_le_bytes());
        for (original, set) in &self.variants {
            out.extend_from_slice(original.as_bytes());
            out.extend_from_slice(&(set.len() as u32).to_le_bytes());
            for processed in set {
                out.extend_from_slice(processed.as_bytes());
            }
        }
        out
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.at.checked_add(N)?;
        let chunk = self.buf.get(self.at..end)?.try_into().ok()?;
        self.at = end;
        Some(chunk)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn digest(&mut self) -> Option<KeyDigest> {
        self.take::<32>().map(KeyDigest::from_bytes)
    }
}

fn load_file(path: &Path) -> io::Result<Variants> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e),
    };

    let mut reader = Reader { buf: &buf, at: 0 };
    if reader.take::<8>() != Some(VariantIndex::MAGIC)
        || reader.u32() != Some(VariantIndex::VERSION)
    {
        return Ok(HashMap::new());
    }
    let Some(groups) = reader.u32() else {
        return Ok(HashMap::new());
    };

    let mut out = HashMap::new();
    // A truncated tail keeps whatever groups were complete.
    'groups: for _ in 0..groups {
        let (Some(original), Some(count)) = (reader.digest(), reader.u32())
        else {
            break;
        };
        let mut set = HashSet::new();
        for _ in 0..count {
            let Some(processed) = reader.digest() else {
                break 'groups;
            };
            set.insert(processed);
        }
        if !set.is_empty() {
            out.insert(original, set);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn digest(name: &str) -> KeyDigest {
        KeyDigest::from_key_str(name)
    }

    #[test]
    fn persisted_index_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("variants.idx");

        let mut index = VariantIndex::load_or_default(path.clone());
        assert!(index.record(digest("a"), digest("a#80")));
        assert!(index.record(digest("a"), digest("a#160")));
        assert!(!index.record(digest("a"), digest("a#80")));
        assert!(index.record(digest("b"), digest("b#80")));
        std::fs::write(&path, index.serialize()).unwrap();

        let mut reloaded = VariantIndex::load_or_default(path);
        assert_eq!(reloaded.len(), 3);
        let mut variants = reloaded.take(&digest("a"));
        variants.sort_by_key(|d| d.to_hex());
        let mut expected = vec![digest("a#80"), digest("a#160")];
        expected.sort_by_key(|d| d.to_hex());
        assert_eq!(variants, expected);
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn foreign_or_truncated_files_are_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("variants.idx");

        std::fs::write(&path, b"not an index").unwrap();
        assert_eq!(VariantIndex::load_or_default(path.clone()).len(), 0);

        let mut index = VariantIndex::load_or_default(path.clone());
        index.record(digest("a"), digest("a#80"));
        index.record(digest("a"), digest("a#160"));
        let bytes = index.serialize();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert_eq!(VariantIndex::load_or_default(path).len(), 0);
    }

    #[test]
    fn retain_present_prunes_missing_files() {
        let dir = tempdir().unwrap();
        let mut index =
            VariantIndex::load_or_default(dir.path().join("variants.idx"));
        index.record(digest("a"), digest("a#80"));
        index.record(digest("a"), digest("a#160"));
        index.record(digest("b"), digest("b#80"));

        let present: HashSet<_> = [digest("a#160")].into_iter().collect();
        assert_eq!(index.retain_present(&present), 2);
        assert_eq!(index.take(&digest("a")), vec![digest("a#160")]);
        assert!(index.take(&digest("b")).is_empty());
        assert!(!index.forget(&digest("b"), &digest("b#80")));
    }
}
