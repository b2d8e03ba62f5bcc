//! Default limits for the image pipeline.
//!
//! These are the compiled defaults behind [`crate::config::PipelineConfig`];
//! every one of them can be overridden at construction time.

use std::time::Duration;

use crate::units::ByteSize;

pub mod disk {
    use super::*;

    /// Entries idle for longer than this are treated as misses.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Lower bound enforced by `configure`.
    pub const MIN_TTL: Duration = Duration::from_secs(60);

    pub const DEFAULT_MAX_BYTES: ByteSize = ByteSize::from_mib(200);

    /// Lower bound enforced by `configure`.
    pub const MIN_MAX_BYTES: ByteSize = ByteSize::from_mib(1);

    /// Re-encode quality for opaque processed images.
    pub const JPEG_QUALITY: u8 = 90;

    /// Marker understood by backup tools (tar, borg, restic) as "skip me".
    pub const CACHEDIR_TAG: &str = "CACHEDIR.TAG";

    pub const CACHEDIR_TAG_CONTENTS: &str = "\
        Signature: 8a477f597d28d172789f06886806bc55\n\
        # This file is a cache directory tag created by softcover-images.\n\
        # Its contents are regenerable and need not be backed up.\n";

    /// Processed variants recorded per address.
    pub const VARIANT_INDEX_FILE: &str = "variants.idx";
}

pub mod memory {
    use super::*;

    pub const DEFAULT_MAX_ENTRIES: usize = 500;

    pub const DEFAULT_MAX_COST: ByteSize = ByteSize::from_mib(128);

    /// Decoded images are accounted as RGBA8.
    pub const BYTES_PER_PIXEL: u64 = 4;
}

pub mod decode {
    /// Sources wider or taller than this are rejected before decoding.
    pub const MAX_DIMENSION: u32 = 16_384;

    /// Ceiling on any single allocation made while decoding.
    pub const MAX_ALLOC: u64 = 256 * 1024 * 1024;
}

pub mod network {
    use super::*;

    /// Retry attempts after the first try.
    pub const DEFAULT_RETRY_COUNT: u32 = 1;

    /// Base delay for exponential backoff.
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    pub const POOL_MAX_IDLE_PER_HOST: usize = 8;
}

pub mod presentation {
    use super::*;

    pub const DEFAULT_FADE_IN: Duration = Duration::from_millis(180);
}
