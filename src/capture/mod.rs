//! Capture abstraction layer
//!
//! A [`CaptureBackend`] enumerates devices and acquires a [`CaptureSource`], which
//! yields frames until it is released. Sources are always held through a
//! [`CaptureGuard`] so they are released exactly once, on every exit path.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub mod command;

pub use command::CommandCaptureBackend;

/// A capture device the backend can open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Backend-specific identifier (a device path for V4L2 cameras)
    pub id: String,
    /// Human readable name
    pub label: String,
}

/// Which device to acquire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// First device the backend reports
    #[default]
    Default,
    /// Prefer a camera facing the given way (`environment` / `user`)
    Facing(String),
    /// A specific device id
    Id(String),
}

impl DeviceSelector {
    /// Parse a configured selector; facing modes are recognised by name
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "default" => DeviceSelector::Default,
            "environment" | "user" => DeviceSelector::Facing(value.trim().to_string()),
            other => DeviceSelector::Id(other.to_string()),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default"),
            DeviceSelector::Facing(mode) => write!(f, "facing:{}", mode),
            DeviceSelector::Id(id) => f.write_str(id),
        }
    }
}

/// A single captured image
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub mime_type: String,
}

impl Frame {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    /// File extension matching the MIME type
    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            "image/x-portable-graymap" => "pgm",
            _ => "img",
        }
    }
}

/// Capture failures, classified for the user
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Access to the camera was refused
    #[error("Camera access denied. Please allow camera permissions and try again.")]
    PermissionDenied,

    /// No usable camera
    #[error("No camera found. Ensure your camera is connected and not in use by another application.")]
    DeviceNotFound,

    /// The camera exists but cannot be read
    #[error("Camera not readable. It may be in use by another application.")]
    DeviceUnreadable,

    /// Anything else
    #[error("Failed to start camera: {0}")]
    Unknown(String),
}

static PERMISSION_SIGNALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)NotAllowedError|SecurityError|permission denied|operation not permitted")
        .expect("valid regex")
});

static NOT_FOUND_SIGNALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)NotFoundError|OverconstrainedError|no such (file|device)|no camera")
        .expect("valid regex")
});

static UNREADABLE_SIGNALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)NotReadableError|TrackStartError|device or resource busy|input/output error")
        .expect("valid regex")
});

impl CaptureError {
    /// Classify a failure message reported by a capture capability
    pub fn from_signal(signal: &str) -> Self {
        if PERMISSION_SIGNALS.is_match(signal) {
            CaptureError::PermissionDenied
        } else if NOT_FOUND_SIGNALS.is_match(signal) {
            CaptureError::DeviceNotFound
        } else if UNREADABLE_SIGNALS.is_match(signal) {
            CaptureError::DeviceUnreadable
        } else {
            CaptureError::Unknown(signal.trim().to_string())
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
            ErrorKind::NotFound => CaptureError::DeviceNotFound,
            _ => CaptureError::from_signal(&e.to_string()),
        }
    }
}

/// Source of camera devices
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// List available capture devices
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Open a device for capture; fails fast if it cannot be opened
    async fn acquire(
        &self,
        selector: &DeviceSelector,
    ) -> Result<Box<dyn CaptureSource>, CaptureError>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// An acquired device producing frames
#[async_trait]
pub trait CaptureSource: Send {
    /// Capture the current frame
    async fn grab_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Free the device. Must succeed as a no-op when already released.
    fn release(&mut self) -> Result<(), CaptureError>;

    /// Device this source was opened on
    fn device(&self) -> &DeviceDescriptor;
}

/// Sole owner of an acquired [`CaptureSource`]
///
/// Releasing is explicit via [`CaptureGuard::release`]; a guard dropped without
/// it (task aborted, controller dropped) releases in `Drop`.
pub struct CaptureGuard {
    source: Option<Box<dyn CaptureSource>>,
}

impl CaptureGuard {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// Grab a frame from the held source
    pub async fn grab_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.source.as_mut() {
            Some(source) => source.grab_frame().await,
            None => Err(CaptureError::Unknown("capture source already released".to_string())),
        }
    }

    /// Release the source; later calls do nothing
    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            let device = source.device().id.clone();
            match source.release() {
                Ok(()) => debug!(device = %device, "Released capture source"),
                Err(e) => warn!(device = %device, "Error releasing capture source: {}", e),
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.release();
    }
}
