//! Media preprocessing and storage.
//!
//! Inline images in the outgoing user message are decoded and, when they
//! exceed the configured dimension or byte limits, resized (preserving
//! aspect ratio when enabled) and re-encoded, iteratively lowering JPEG
//! quality while the payload stays over the byte ceiling. Images at or
//! under every limit pass through untouched when `skip_if_smaller` is
//! set. Supported inputs: JPEG, PNG, GIF, WebP; output is JPEG or PNG.
//!
//! Separately, [`MediaStorage`] owns the bytes of media parts that were
//! externalized past the conversation's size threshold; the message log
//! keeps only a [`MediaHandle`].

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use crate::colloquy::error::BoxError;
use crate::colloquy::message::MediaHandle;

/// Output encoding for preprocessed images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JPEG at the policy's quality (no alpha).
    Jpeg,
    /// PNG (lossless, keeps alpha).
    Png,
}

/// Limits and encoding choices for image preprocessing.
#[derive(Debug, Clone)]
pub struct MediaPolicy {
    /// Maximum width in pixels.
    pub max_width: u32,
    /// Maximum height in pixels.
    pub max_height: u32,
    /// Maximum encoded size in bytes.
    pub max_size_bytes: usize,
    /// Preserve aspect ratio when resizing.
    pub preserve_aspect: bool,
    /// JPEG quality (1–100).
    pub quality: u8,
    /// Leave images under every limit untouched.
    pub skip_if_smaller: bool,
    /// Output encoding.
    pub output: OutputFormat,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            max_width: 2048,
            max_height: 2048,
            max_size_bytes: 5 * 1024 * 1024,
            preserve_aspect: true,
            quality: 85,
            skip_if_smaller: true,
            output: OutputFormat::Jpeg,
        }
    }
}

/// Result of preprocessing one image.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Encoded bytes (the original bytes when untouched).
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub mime: String,
    /// Final width.
    pub width: u32,
    /// Final height.
    pub height: u32,
    /// False when the image passed through untouched.
    pub changed: bool,
}

/// Decode, bound, and re-encode one inline image according to the policy.
pub fn preprocess_image(
    bytes: &[u8],
    mime: &str,
    policy: &MediaPolicy,
) -> Result<ProcessedImage, BoxError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| -> BoxError { format!("failed to decode {}: {}", mime, e).into() })?;
    let (width, height) = (img.width(), img.height());

    let over_dimensions = width > policy.max_width || height > policy.max_height;
    let over_bytes = bytes.len() > policy.max_size_bytes;
    if policy.skip_if_smaller && !over_dimensions && !over_bytes {
        return Ok(ProcessedImage {
            data: bytes.to_vec(),
            mime: mime.to_string(),
            width,
            height,
            changed: false,
        });
    }

    let resized = if over_dimensions {
        if policy.preserve_aspect {
            img.resize(
                policy.max_width,
                policy.max_height,
                image::imageops::FilterType::Lanczos3,
            )
        } else {
            img.resize_exact(
                policy.max_width,
                policy.max_height,
                image::imageops::FilterType::Lanczos3,
            )
        }
    } else {
        img
    };

    let (mut data, out_mime) = encode(&resized, policy.output, policy.quality)?;

    // Lossless output cannot trade quality for size; JPEG can.
    if policy.output == OutputFormat::Jpeg {
        let mut quality = policy.quality;
        while data.len() > policy.max_size_bytes && quality > 20 {
            quality = quality.saturating_sub(10).max(20);
            debug!("re-encoding at quality {} ({} bytes over)", quality, data.len());
            data = encode(&resized, OutputFormat::Jpeg, quality)?.0;
        }
    }
    if data.len() > policy.max_size_bytes {
        warn!(
            "image still {} bytes after preprocessing (ceiling {})",
            data.len(),
            policy.max_size_bytes
        );
    }

    Ok(ProcessedImage {
        width: resized.width(),
        height: resized.height(),
        data,
        mime: out_mime,
        changed: true,
    })
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<(Vec<u8>, String), BoxError> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            rgb.write_with_encoder(encoder)?;
            Ok((buf.into_inner(), "image/jpeg".to_string()))
        }
        OutputFormat::Png => {
            img.write_to(&mut buf, ImageFormat::Png)?;
            Ok((buf.into_inner(), "image/png".to_string()))
        }
    }
}

/// True when a MIME type names an image format the preprocessor accepts.
pub fn is_supported_image(mime: &str) -> bool {
    matches!(
        mime,
        "image/jpeg" | "image/png" | "image/gif" | "image/webp"
    )
}

// ---------------------------------------------------------------------------
// Media storage
// ---------------------------------------------------------------------------

/// Owns the bytes of externalized media parts for the lifetime of a
/// conversation.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Store bytes and return the handle placed into the message log.
    async fn put(&self, mime: &str, data: Vec<u8>) -> Result<MediaHandle, BoxError>;

    /// Fetch the bytes behind a handle.
    async fn get(&self, handle: &MediaHandle) -> Result<Vec<u8>, BoxError>;
}

/// In-memory media storage using the `mem` scheme.
#[derive(Default)]
pub struct InMemoryMediaStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryMediaStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaStorage for InMemoryMediaStorage {
    async fn put(&self, mime: &str, data: Vec<u8>) -> Result<MediaHandle, BoxError> {
        let uri = uuid::Uuid::new_v4().to_string();
        let digest = Sha256::digest(&data);
        let checksum: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let handle = MediaHandle {
            scheme: "mem".to_string(),
            uri: uri.clone(),
            mime: mime.to_string(),
            size: data.len() as u64,
            checksum,
        };
        self.objects.lock().unwrap().insert(uri, data);
        Ok(handle)
    }

    async fn get(&self, handle: &MediaHandle) -> Result<Vec<u8>, BoxError> {
        self.objects
            .lock()
            .unwrap()
            .get(&handle.uri)
            .cloned()
            .ok_or_else(|| -> BoxError { format!("no object for uri '{}'", handle.uri).into() })
    }
}
