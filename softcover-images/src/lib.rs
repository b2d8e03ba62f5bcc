//! Cover image acquisition and caching.
//!
//! Request an image for a locator at a display size and receive a stream of
//! [`LoadPhase`]s. Behind that sit a bounded in-memory tier of decoded
//! images, a persistent directory of raw and re-encoded bytes with TTL and
//! size eviction, a coalescer that collapses concurrent fetches of one
//! address, a retrying fetcher, and a downsampler.
//!
//! ```no_run
//! use softcover_images::{
//!     ImagePipeline, ImageRequest, Locator, PipelineConfig, TransformSpec,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pipeline = ImagePipeline::new(PipelineConfig::default())?;
//! let request = ImageRequest::new(
//!     Locator::parse("https://assets.example.com/covers/42.jpg")?,
//!     TransformSpec::points(120, 2),
//! );
//! let phase = pipeline.load(request).wait().await;
//! if let Some(image) = phase.image() {
//!     println!("{}x{}", image.width(), image.height());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod cover;
pub mod disk;
pub mod downsample;
pub mod error;
pub mod fetch;
pub mod key;
pub mod loader;
pub mod memory;
pub mod pipeline;
pub mod units;

pub use config::{PipelineConfig, TaskPriority};
pub use cover::CoverImage;
pub use error::{DecodeError, LoadError, NetworkError};
pub use key::{CacheKey, ImageRequest, Locator, PixelUnit, TransformSpec};
pub use loader::{ImageLoader, LoadHandle, LoadPhase};
pub use pipeline::{ImagePipeline, PipelineStats};
pub use units::ByteSize;
