//! Decode-and-shrink for downloaded image bytes.
//!
//! Bounded JPEG requests decode at 1/2, 1/4 or 1/8 scale, the smallest
//! that still covers the target, so large covers never materialise at full
//! resolution. Other formats decode whole under [`image::Limits`]. The
//! result is then fit inside a `target x target` box on the longest side,
//! with EXIF orientation applied.

use std::io::Cursor;

use bytes::Bytes;
use image::{
    DynamicImage, GrayImage, ImageDecoder, ImageFormat, ImageReader, Limits,
    RgbImage, metadata::Orientation,
};
use jpeg_decoder::PixelFormat;

use crate::{constants::decode, cover::CoverImage, key::TransformSpec};

/// Off the async runtime; `None` when neither decode path succeeds.
pub async fn downsample(
    bytes: Bytes,
    spec: TransformSpec,
) -> Option<CoverImage> {
    let task =
        tokio::task::spawn_blocking(move || downsample_sync(&bytes, &spec));
    match task.await {
        Ok(image) => image,
        Err(e) => {
            log::warn!("downsample task failed: {e}");
            None
        }
    }
}

pub fn downsample_sync(
    bytes: &[u8],
    spec: &TransformSpec,
) -> Option<CoverImage> {
    let target = spec.target_pixels();
    let decoded = match decode_oriented(bytes, target) {
        Ok(img) => img,
        Err(e) => {
            log::debug!("oriented decode failed, falling back; err={e}");
            match decode_plain(bytes) {
                Ok(img) => img,
                Err(e) => {
                    log::debug!("plain decode failed; err={e}");
                    return None;
                }
            }
        }
    };

    let fitted = match target {
        Some(t) if decoded.width() > t || decoded.height() > t => {
            decoded.thumbnail(t, t)
        }
        _ => decoded,
    };
    Some(CoverImage::new(fitted))
}

/// Full decode with no resizing.
pub fn decode_full(bytes: &[u8]) -> Option<CoverImage> {
    downsample_sync(bytes, &TransformSpec::original(1))
}

fn limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(decode::MAX_DIMENSION);
    limits.max_image_height = Some(decode::MAX_DIMENSION);
    limits.max_alloc = Some(decode::MAX_ALLOC);
    limits
}

fn reader(bytes: &[u8]) -> image::ImageResult<ImageReader<Cursor<&[u8]>>> {
    let mut reader =
        ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits());
    Ok(reader)
}

fn decode_oriented(
    bytes: &[u8],
    target: Option<u32>,
) -> image::ImageResult<DynamicImage> {
    if let Some(target) = target
        && image::guess_format(bytes).ok() == Some(ImageFormat::Jpeg)
    {
        match decode_jpeg_scaled(bytes, target) {
            Ok(Some(img)) => return Ok(img),
            Ok(None) => {}
            Err(e) => log::debug!("scaled jpeg decode failed; err={e}"),
        }
    }

    let mut decoder = reader(bytes)?.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn decode_plain(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    reader(bytes)?.decode()
}

/// `Ok(None)` for pixel formats left to the general decoder.
fn decode_jpeg_scaled(
    bytes: &[u8],
    target: u32,
) -> Result<Option<DynamicImage>, jpeg_decoder::Error> {
    let mut decoder = jpeg_decoder::Decoder::new(bytes);
    decoder.set_max_decoding_buffer_size(decode::MAX_ALLOC as usize);
    decoder.read_info()?;
    let format = decoder.info().map(|info| info.pixel_format);
    if !matches!(format, Some(PixelFormat::RGB24 | PixelFormat::L8)) {
        return Ok(None);
    }

    let request = u16::try_from(target).unwrap_or(u16::MAX);
    let (width, height) = decoder.scale(request, request)?;
    let pixels = decoder.decode()?;
    let (width, height) = (u32::from(width), u32::from(height));

    let img = match format {
        Some(PixelFormat::RGB24) => RgbImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgb8),
        _ => GrayImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageLuma8),
    };
    let Some(mut img) = img else {
        return Ok(None);
    };

    if let Some(orientation) =
        decoder.exif_data().and_then(Orientation::from_exif_chunk)
    {
        img.apply_orientation(orientation);
    }
    Ok(Some(img))
}
