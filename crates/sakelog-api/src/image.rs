use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

/// Default bounding width of the inline preview.
pub const DEFAULT_INLINE_MAX_WIDTH: u32 = 360;

/// Narrower widths give a zero-height 9:16 box.
pub const MIN_INLINE_MAX_WIDTH: u32 = 9;

const INLINE_MIME: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("file is empty")]
    Empty,
    #[error("unrecognized image format: {0}")]
    UnknownFormat(#[source] image::ImageError),
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode inline preview: {0}")]
    Encode(#[source] image::ImageError),
}

/// An uploaded file that decoded successfully, together with the format it was sniffed as.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
}

impl DecodedImage {
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    #[must_use]
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }
}

/// Portrait bound for a given width, 9:16.
#[must_use]
pub fn max_height_for_width(max_width: u32) -> u32 {
    max_width / 9 * 16
}

/// Sniff and decode an uploaded file.
///
/// # Errors
/// Returns an [`ImageError`] when the bytes are empty, not a known image format, or corrupt.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }
    let format = image::guess_format(bytes).map_err(ImageError::UnknownFormat)?;
    let image = image::load_from_memory_with_format(bytes, format).map_err(ImageError::Decode)?;
    Ok(DecodedImage { image, format })
}

/// Fit `image` inside `max_width` x `max_height` and return it as a base64 JPEG data URI.
///
/// Aspect ratio is preserved and images already inside the box are not upscaled.
///
/// # Errors
/// Returns [`ImageError::Encode`] when JPEG encoding fails.
pub fn resize_and_encode(
    image: &DynamicImage,
    max_width: u32,
    max_height: u32,
) -> Result<String, ImageError> {
    let (width, height) = image.dimensions();
    let fitted = if width > max_width || height > max_height {
        image.resize(max_width, max_height, FilterType::Lanczos3)
    } else {
        image.clone()
    };

    // JPEG carries no alpha channel.
    let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());
    let mut encoded = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Jpeg).map_err(ImageError::Encode)?;

    Ok(format!("data:{INLINE_MIME};base64,{}", general_purpose::STANDARD.encode(encoded)))
}
