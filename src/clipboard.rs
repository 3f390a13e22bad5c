//! Clipboard access for copying scanned payloads
//!
//! [`ClipboardProvider`] is the seam; [`SystemClipboard`] writes through arboard on
//! a blocking thread since the platform clipboard APIs are synchronous.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Nothing to copy
    #[error("No content to copy")]
    NoContent,
}

/// Clipboard provider trait
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Replace the clipboard contents with `text`
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// The desktop clipboard
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        if text.is_empty() {
            return Err(ClipboardError::NoContent);
        }

        let text = text.to_string();
        let len = text.len();
        tokio::task::spawn_blocking(move || {
            let mut clipboard =
                arboard::Clipboard::new().map_err(|e| ClipboardError::Platform(e.to_string()))?;
            clipboard
                .set_text(text)
                .map_err(|e| ClipboardError::Platform(e.to_string()))
        })
        .await
        .map_err(|e| ClipboardError::Platform(format!("clipboard task failed: {}", e)))??;

        debug!(bytes = len, "Copied text to clipboard");
        Ok(())
    }

    fn name(&self) -> &str {
        "arboard"
    }
}
