//! Transport decoding for uploaded and captured images.
//!
//! Clients send base64, optionally wrapped as a data URL
//! (`data:image/jpeg;base64,...`). A payload is only accepted once the
//! bytes fully decode as an image the worker can read.

use base64::{engine::general_purpose, Engine};
use image::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a readable image: {0}")]
    Image(#[from] image::ImageError),
    #[error("unsupported image format: {0:?} (need JPEG, PNG, or BMP)")]
    UnsupportedFormat(ImageFormat),
}

/// Validated image bytes, kept in their original encoding.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl DecodedImage {
    /// File extension to store the image under.
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            _ => "bmp",
        }
    }
}

/// Strip a `data:<mime>;base64,` prefix if present.
fn strip_data_url(encoded: &str) -> &str {
    if encoded.starts_with("data:") {
        match encoded.find(',') {
            Some(idx) => &encoded[idx + 1..],
            None => "",
        }
    } else {
        encoded
    }
}

/// Decode one transport-encoded image.
pub fn decode_image(encoded: &str) -> Result<DecodedImage, DecodeError> {
    let body: String = strip_data_url(encoded.trim())
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }

    let bytes = general_purpose::STANDARD.decode(body.as_bytes())?;
    let format = image::guess_format(&bytes)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp) {
        return Err(DecodeError::UnsupportedFormat(format));
    }
    // Full decode so truncated or corrupt files are caught here, not by the worker.
    image::load_from_memory_with_format(&bytes, format)?;

    Ok(DecodedImage { bytes, format })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::encoded_image;

    #[test]
    fn test_decode_png_and_jpeg() {
        let png = decode_image(&encoded_image(ImageFormat::Png)).unwrap();
        assert_eq!(png.format, ImageFormat::Png);
        assert_eq!(png.extension(), "png");

        let jpg = decode_image(&encoded_image(ImageFormat::Jpeg)).unwrap();
        assert_eq!(jpg.extension(), "jpg");
    }

    #[test]
    fn test_decode_data_url() {
        let url = format!("data:image/png;base64,{}", encoded_image(ImageFormat::Png));
        assert!(decode_image(&url).is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(""), Err(DecodeError::Empty)));
        assert!(matches!(decode_image("data:image/png;base64,"), Err(DecodeError::Empty)));
        assert!(matches!(decode_image("!!not base64!!"), Err(DecodeError::Base64(_))));
        // Valid base64, not an image.
        let text = general_purpose::STANDARD.encode(b"hello world, not a picture");
        assert!(matches!(decode_image(&text), Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_image() {
        let full = general_purpose::STANDARD
            .decode(encoded_image(ImageFormat::Png))
            .unwrap();
        let truncated = general_purpose::STANDARD.encode(&full[..full.len() / 2]);
        assert!(decode_image(&truncated).is_err());
    }
}
