use std::borrow::Cow;
use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, ImageReader};
use tracing::debug;

use crate::studio::error::StudioError;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => lowered,
    }
}

pub fn is_supported_image_mime(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "image/png" | "image/jpeg" | "image/webp" | "image/heic" | "image/heif"
    )
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "image/heif" => "heif",
        _ => "png",
    }
}

/// The uploaded portrait, validated once and shared by every request of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    bytes: Vec<u8>,
    mime_type: String,
    dimensions: Option<(u32, u32)>,
}

impl SourceImage {
    /// Validates the bytes against the declared MIME type.
    ///
    /// An empty or blank declared type falls back to sniffing the content.
    /// HEIC/HEIF sources are accepted without decoding since the decoder
    /// stack here cannot read them; the remote API can.
    pub fn from_bytes(bytes: Vec<u8>, declared_mime: Option<&str>) -> Result<Self, StudioError> {
        if bytes.is_empty() {
            return Err(StudioError::EmptyImage);
        }

        let mime_type = declared_mime
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(normalize_image_mime_type)
            .or_else(|| detect_mime_type(&bytes).map(|value| normalize_image_mime_type(&value)))
            .ok_or_else(|| StudioError::UnsupportedMimeType("unknown".to_string()))?;

        if !is_supported_image_mime(&mime_type) {
            return Err(StudioError::UnsupportedMimeType(mime_type));
        }

        let dimensions = if matches!(mime_type.as_str(), "image/heic" | "image/heif") {
            None
        } else {
            let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
                .with_guessed_format()
                .map_err(|err| StudioError::UndecodableImage(err.to_string()))?;
            let dimensions = reader
                .into_dimensions()
                .map_err(|err| StudioError::UndecodableImage(err.to_string()))?;
            Some(dimensions)
        };

        Ok(Self {
            bytes,
            mime_type,
            dimensions,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Reads an upload from disk with its sniffed MIME type (empty when unknown).
pub async fn read_upload(path: &Path) -> Result<(Vec<u8>, String), StudioError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| StudioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let detected = detect_mime_type(&bytes);
    debug!(
        path = %path.display(),
        len = bytes.len(),
        detected = ?detected,
        "Loaded source image"
    );
    Ok((bytes, detected.unwrap_or_default()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    bytes: Vec<u8>,
    mime_type: String,
}

impl GeneratedImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let mime_type = normalize_image_mime_type(&mime_type.into());
        let mime_type = if mime_type.starts_with("image/") {
            mime_type
        } else {
            "image/png".to_string()
        };
        Self { bytes, mime_type }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn file_extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }

    /// PNG encoding of the rendering. Other formats are decoded and re-encoded.
    pub fn png_bytes(&self) -> Result<Cow<'_, [u8]>, image::ImageError> {
        if self.mime_type == "image/png" {
            return Ok(Cow::Borrowed(&self.bytes));
        }
        let decoded = image::load_from_memory(&self.bytes)?;
        let mut png = Vec::new();
        decoded.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(Cow::Owned(png))
    }

    /// Inline reference usable wherever a URL to the image is expected.
    #[allow(dead_code)]
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    use image::{DynamicImage, RgbImage};

    let mut seed = 0x2545_f491_u32;
    let img = RgbImage::from_fn(width, height, |x, y| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let noise = (seed & 0x3f) as u8;
        image::Rgb([
            (x % 256) as u8 ^ noise,
            (y % 256) as u8,
            ((x + y) % 256) as u8 ^ noise,
        ])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .expect("encode sample jpeg");
    bytes
}
