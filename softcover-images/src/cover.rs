use std::{fmt, sync::Arc};

use image::DynamicImage;

use crate::{constants::memory::BYTES_PER_PIXEL, units::ByteSize};

/// A decoded, display-ready image.
///
/// Cheap to clone; every tier and every subscriber shares one allocation.
#[derive(Clone)]
pub struct CoverImage {
    image: Arc<DynamicImage>,
}

impl CoverImage {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn has_alpha(&self) -> bool {
        self.image.color().has_alpha()
    }

    /// Approximate resident size, accounted as RGBA8.
    pub fn cost(&self) -> ByteSize {
        ByteSize::from_bytes(
            u64::from(self.width())
                .saturating_mul(u64::from(self.height()))
                .saturating_mul(BYTES_PER_PIXEL),
        )
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// True when both handles point at the same decoded allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl From<DynamicImage> for CoverImage {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}

impl fmt::Debug for CoverImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.image.color())
            .finish()
    }
}
