//! Request identity and cache-key derivation.
//!
//! Every tier of the pipeline keys off [`CacheKey`]: the memory cache stores
//! processed keys, the disk cache hashes either variant to a file name, and
//! the coalescer uses the locator address alone.

use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use url::Url;

/// Network address of an image plus optional request metadata.
///
/// Only the address takes part in identity; headers and method ride along to
/// the transport.
#[derive(Clone)]
pub struct Locator {
    url: Url,
    method: Method,
    headers: Vec<(String, String)>,
}

impl Locator {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: Vec::new(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Url::parse(url).map(Self::new)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn address(&self) -> &str {
        self.url.as_str()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Locator {}

impl std::hash::Hash for Locator {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locator")
            .field("url", &self.address())
            .field("method", &self.method)
            .field("headers", &self.headers.len())
            .finish()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

/// Unit that `max_dimension` is expressed in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PixelUnit {
    /// Logical points; multiplied by `scale` to get device pixels.
    #[default]
    Points,
    Pixels,
}

impl PixelUnit {
    pub fn tag(self) -> &'static str {
        match self {
            PixelUnit::Points => "pt",
            PixelUnit::Pixels => "px",
        }
    }
}

/// Desired output size for a requested image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformSpec {
    pub max_dimension: Option<u32>,
    pub unit: PixelUnit,
    pub scale: u32,
}

impl TransformSpec {
    /// Full resolution, no bound.
    pub const fn original(scale: u32) -> Self {
        Self {
            max_dimension: None,
            unit: PixelUnit::Points,
            scale,
        }
    }

    pub const fn points(max_dimension: u32, scale: u32) -> Self {
        Self {
            max_dimension: Some(max_dimension),
            unit: PixelUnit::Points,
            scale,
        }
    }

    pub const fn pixels(max_dimension: u32, scale: u32) -> Self {
        Self {
            max_dimension: Some(max_dimension),
            unit: PixelUnit::Pixels,
            scale,
        }
    }

    /// Scale as used for sizing; a zero scale is treated as 1x.
    pub fn effective_scale(&self) -> u32 {
        self.scale.max(1)
    }

    /// Longest-side bound in device pixels, if any.
    pub fn target_pixels(&self) -> Option<u32> {
        let bound = self.max_dimension.filter(|m| *m > 0)?;
        Some(match self.unit {
            PixelUnit::Points => bound.saturating_mul(self.effective_scale()),
            PixelUnit::Pixels => bound,
        })
    }
}

/// Identity of one cache entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Untouched fetched bytes.
    Original { address: String },
    /// Bytes after applying a [`TransformSpec`].
    Processed {
        address: String,
        spec: TransformSpec,
    },
}

impl CacheKey {
    pub fn original(locator: &Locator) -> Self {
        CacheKey::Original {
            address: locator.address().to_string(),
        }
    }

    pub fn processed(locator: &Locator, spec: &TransformSpec) -> Self {
        CacheKey::Processed {
            address: locator.address().to_string(),
            spec: *spec,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            CacheKey::Original { address }
            | CacheKey::Processed { address, .. } => address,
        }
    }

    /// Stable string form.
    ///
    /// Processed keys always carry unit tag and scale, so "no bound at 2x"
    /// and "no bound at 3x" stay distinct entries.
    pub fn render(&self) -> String {
        match self {
            CacheKey::Original { address } => address.clone(),
            CacheKey::Processed { address, spec } => {
                let unit = spec.unit.tag();
                let scale = spec.scale;
                match spec.max_dimension {
                    Some(bound) => {
                        format!("{address}#p={bound}{unit}@{scale}x")
                    }
                    None => format!("{address}#orig{unit}@{scale}x"),
                }
            }
        }
    }

    pub fn digest(&self) -> KeyDigest {
        KeyDigest::from_key_str(&self.render())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.render()).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Fixed-length digest of a rendered key; names the entry's file on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDigest([u8; 32]);

impl KeyDigest {
    pub fn from_key_str(key: &str) -> Self {
        let digest = sha2::Sha256::digest(key.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Inverse of [`Self::to_hex`]; `None` for anything else.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(raw, &mut out).ok()?;
        Some(Self(out))
    }

    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyDigest").field(&self.to_hex()).finish()
    }
}

/// Everything a consumer asks for in one load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRequest {
    pub locator: Locator,
    pub spec: TransformSpec,
}

impl ImageRequest {
    pub fn new(locator: Locator, spec: TransformSpec) -> Self {
        Self { locator, spec }
    }

    pub fn original_key(&self) -> CacheKey {
        CacheKey::original(&self.locator)
    }

    pub fn processed_key(&self) -> CacheKey {
        CacheKey::processed(&self.locator, &self.spec)
    }
}
