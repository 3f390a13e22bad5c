//! QR decoding capability
//!
//! Symbol recognition itself is delegated to an external decoder. A frame without
//! a symbol is the normal case while a camera is pointed at nothing; it is
//! reported as [`DecodeError::NotFound`] and never treated as a failure.

use std::path::Path;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::capture::Frame;

pub mod command;

pub use command::CommandDecoder;

/// Decode failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No QR symbol in the image
    #[error("No QR code found in the image")]
    NotFound,

    /// The image or decoder could not be processed
    #[error("Image could not be decoded: {0}")]
    Unreadable(String),
}

impl DecodeError {
    /// Whether this is an expected per-frame miss
    pub fn is_miss(&self) -> bool {
        matches!(self, DecodeError::NotFound)
    }
}

static MISS_SIGNALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)NotFoundException|QR code parse error|No MultiFormat Readers|no symbols? found|scanned 0 barcode")
        .expect("valid regex")
});

/// Whether a decoder diagnostic only says that no symbol was present
pub fn is_miss_message(message: &str) -> bool {
    MISS_SIGNALS.is_match(message)
}

/// A still image submitted for one-shot decoding
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// Display name, usually the file name
    pub name: String,
    /// Encoded image bytes
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Read an image file
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, data })
    }

    /// Extension of the file name, if any
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|e| e.to_str())
    }
}

/// Converts images into decoded text
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decode a camera frame
    async fn decode_frame(&self, frame: &Frame) -> Result<String, DecodeError>;

    /// Decode a user supplied image
    async fn decode_image(&self, image: &ImageInput) -> Result<String, DecodeError>;
}
