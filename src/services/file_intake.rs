// src/services/file_intake.rs
use crate::errors::ValidationError;
use crate::models::ImageSummary;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use log::{debug, warn};
use serde::Deserialize;
use std::io::Cursor;

pub const ACCEPTED_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/jpg"];

/// 5 MiB. A payload of exactly this size is accepted.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// How the user handed us the file. Both go through the same validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeSource {
    #[default]
    Browse,
    Drop,
}

/// A leaf photograph that passed validation.
///
/// Only `FileIntake` can build one, so holding an `ImageAsset` is proof the
/// bytes have an accepted type and size.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    data: Bytes,
    content_type: String,
    size: usize,
    filename: Option<String>,
    dimensions: Option<(u32, u32)>,
}

impl ImageAsset {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    /// `data:` URI suitable for an `<img src>`. Encoded on demand.
    pub fn preview_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            general_purpose::STANDARD.encode(&self.data)
        )
    }
}

impl From<&ImageAsset> for ImageSummary {
    fn from(asset: &ImageAsset) -> Self {
        Self {
            filename: asset.filename.clone(),
            content_type: asset.content_type.clone(),
            size: asset.size,
            dimensions: asset.dimensions,
            preview: asset.preview_data_uri(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FileIntake;

impl FileIntake {
    pub fn new() -> Self {
        Self
    }

    /// Single entry point for every upload path.
    pub fn accept(
        &self,
        source: IntakeSource,
        filename: Option<String>,
        data: impl Into<Bytes>,
        declared_type: &str,
        size: usize,
    ) -> Result<ImageAsset, ValidationError> {
        match self.validate(data, declared_type, size) {
            Ok(mut asset) => {
                debug!(
                    "Accepted {:?} upload ({} bytes, {})",
                    source, asset.size, asset.content_type
                );
                asset.filename = filename;
                Ok(asset)
            }
            Err(e) => {
                warn!("Rejected {:?} upload: {}", source, e);
                Err(e)
            }
        }
    }

    pub fn validate(
        &self,
        data: impl Into<Bytes>,
        declared_type: &str,
        size: usize,
    ) -> Result<ImageAsset, ValidationError> {
        let content_type = normalize_type(declared_type)
            .ok_or_else(|| ValidationError::UnsupportedType(declared_type.to_string()))?;

        let data = data.into();
        let size = size.max(data.len());
        if size > MAX_IMAGE_BYTES {
            return Err(ValidationError::TooLarge {
                size,
                limit: MAX_IMAGE_BYTES,
            });
        }

        let dimensions = read_dimensions(&data);

        Ok(ImageAsset {
            data,
            content_type,
            size,
            filename: None,
            dimensions,
        })
    }
}

fn normalize_type(declared: &str) -> Option<String> {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ACCEPTED_TYPES
        .contains(&essence.as_str())
        .then_some(essence)
}

// Header-only probe; undecodable bytes are not a validation failure.
fn read_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};

    fn tiny_png() -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(3, 2))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn rejects_types_outside_allow_set() {
        let intake = FileIntake::new();
        for declared in ["image/gif", "image/webp", "text/plain", "", "application/pdf"] {
            let err = intake.validate(vec![1, 2, 3], declared, 3).unwrap_err();
            assert_eq!(err, ValidationError::UnsupportedType(declared.to_string()));
        }
    }

    #[test]
    fn accepts_all_allowed_types() {
        let intake = FileIntake::new();
        for declared in ACCEPTED_TYPES {
            assert!(intake.validate(vec![1, 2, 3], declared, 3).is_ok(), "{declared}");
        }
        let asset = intake.validate(vec![1], "Image/PNG; q=1", 1).unwrap();
        assert_eq!(asset.content_type(), "image/png");
    }

    #[test]
    fn size_limit_is_inclusive() {
        let intake = FileIntake::new();
        let at_limit = vec![0u8; MAX_IMAGE_BYTES];
        assert!(intake.validate(at_limit, "image/jpeg", MAX_IMAGE_BYTES).is_ok());

        let over = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = intake.validate(over, "image/jpeg", MAX_IMAGE_BYTES + 1).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooLarge {
                size: MAX_IMAGE_BYTES + 1,
                limit: MAX_IMAGE_BYTES
            }
        );
    }

    #[test]
    fn declared_size_counts_even_when_bytes_were_truncated() {
        let intake = FileIntake::new();
        let err = intake
            .validate(vec![0u8; 16], "image/png", 6 * 1024 * 1024)
            .unwrap_err();
        assert_eq!(err.kind(), "too_large");
    }

    #[test]
    fn type_is_checked_before_size() {
        let intake = FileIntake::new();
        let err = intake
            .validate(vec![0u8; 8], "image/gif", 6 * 1024 * 1024)
            .unwrap_err();
        assert_eq!(err.kind(), "unsupported_type");
    }

    #[test]
    fn preview_decodes_to_original_bytes() {
        let original = tiny_png();
        let asset = FileIntake::new()
            .validate(original.clone(), "image/png", original.len())
            .unwrap();

        let uri = asset.preview_data_uri();
        let encoded = uri.strip_prefix("data:image/png;base64,").unwrap();
        let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn reads_dimensions_when_header_is_valid() {
        let png = tiny_png();
        let asset = FileIntake::new().validate(png.clone(), "image/png", png.len()).unwrap();
        assert_eq!(asset.dimensions(), Some((3, 2)));

        let junk = FileIntake::new().validate(vec![9u8; 32], "image/png", 32).unwrap();
        assert_eq!(junk.dimensions(), None);
    }

    #[test]
    fn browse_and_drop_share_validation() {
        let intake = FileIntake::new();
        for source in [IntakeSource::Browse, IntakeSource::Drop] {
            let asset = intake
                .accept(source, Some("leaf.jpg".into()), vec![1, 2], "image/jpg", 2)
                .unwrap();
            assert_eq!(asset.filename(), Some("leaf.jpg"));

            let err = intake
                .accept(source, None, vec![1, 2], "image/bmp", 2)
                .unwrap_err();
            assert_eq!(err.kind(), "unsupported_type");
        }
    }
}
