//! Decoding through an external tool (zbarimg by default)

use std::io::Write;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::trace;

use super::{is_miss_message, DecodeError, Decoder, ImageInput};
use crate::capture::Frame;
use crate::config::ScannerConfig;
use crate::process;

/// zbarimg exits with this status when it found no symbol
const NO_SYMBOL_EXIT_CODE: i32 = 4;

/// Decoder that writes the image to a temporary file and runs a command on it
pub struct CommandDecoder {
    command: Vec<String>,
}

impl CommandDecoder {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.decode_command.clone())
    }

    async fn decode_bytes(&self, data: &[u8], extension: &str) -> Result<String, DecodeError> {
        let mut file = tempfile::Builder::new()
            .prefix("qrscan-")
            .suffix(&format!(".{}", extension))
            .tempfile()
            .map_err(|e| DecodeError::Unreadable(format!("failed to stage image: {}", e)))?;
        write_all(&mut file, data)?;

        let image = file.path().to_string_lossy().to_string();
        let args = process::render_args(&self.command, &[("image", image.as_str())]);

        let output = process::run(&args)
            .await
            .map_err(|e| DecodeError::Unreadable(format!("failed to run decoder: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if output.status.code() == Some(NO_SYMBOL_EXIT_CODE) || is_miss_message(&stderr) {
                return Err(DecodeError::NotFound);
            }
            return Err(DecodeError::Unreadable(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout.strip_suffix('\n').unwrap_or(&*stdout);
        if text.is_empty() {
            trace!("Decoder succeeded without output");
            return Err(DecodeError::NotFound);
        }
        Ok(text.to_string())
    }
}

fn write_all(file: &mut NamedTempFile, data: &[u8]) -> Result<(), DecodeError> {
    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|e| DecodeError::Unreadable(format!("failed to stage image: {}", e)))
}

#[async_trait]
impl Decoder for CommandDecoder {
    async fn decode_frame(&self, frame: &Frame) -> Result<String, DecodeError> {
        self.decode_bytes(&frame.data, frame.extension()).await
    }

    async fn decode_image(&self, image: &ImageInput) -> Result<String, DecodeError> {
        if image.data.is_empty() {
            return Err(DecodeError::Unreadable(format!("{} is empty", image.name)));
        }
        let extension = image.extension().unwrap_or("img").to_string();
        self.decode_bytes(&image.data, &extension).await
    }
}
