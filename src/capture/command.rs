//! Camera capture through V4L2 device nodes and an external snapshot tool
//!
//! Devices are the `videoN` nodes of a device directory (normally `/dev`). Each
//! frame is produced by running the configured capture command (ffmpeg by
//! default) which writes one image to a scratch directory owned by the source.

use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info};

use super::{CaptureBackend, CaptureError, CaptureSource, DeviceDescriptor, DeviceSelector, Frame};
use crate::config::ScannerConfig;
use crate::process;

const FRAME_FILE: &str = "frame.png";

/// Backend that enumerates device nodes and shells out for frames
pub struct CommandCaptureBackend {
    device_dir: PathBuf,
    command: Vec<String>,
}

impl CommandCaptureBackend {
    pub fn new(device_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            device_dir: device_dir.into(),
            command,
        }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(config.device_dir.clone(), config.capture_command.clone())
    }

    fn select<'a>(
        devices: &'a [DeviceDescriptor],
        selector: &DeviceSelector,
    ) -> Option<&'a DeviceDescriptor> {
        match selector {
            DeviceSelector::Id(id) => devices.iter().find(|d| &d.id == id || &d.label == id),
            // Device nodes carry no facing information
            DeviceSelector::Default | DeviceSelector::Facing(_) => devices.first(),
        }
    }
}

fn is_video_node(name: &str) -> bool {
    name.strip_prefix("video")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

#[async_trait]
impl CaptureBackend for CommandCaptureBackend {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let mut entries = match tokio::fs::read_dir(&self.device_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut devices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_video_node(&name) {
                devices.push(DeviceDescriptor {
                    id: entry.path().to_string_lossy().to_string(),
                    label: name,
                });
            }
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = devices.len(), dir = %self.device_dir.display(), "Enumerated capture devices");
        Ok(devices)
    }

    async fn acquire(
        &self,
        selector: &DeviceSelector,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let devices = self.enumerate_devices().await?;
        let device = Self::select(&devices, selector)
            .cloned()
            .ok_or(CaptureError::DeviceNotFound)?;

        // Opening the node surfaces permission and busy errors before any frame
        tokio::fs::File::open(&device.id).await?;

        let workdir = tempfile::Builder::new()
            .prefix("qrscan-capture-")
            .tempdir()
            .map_err(|e| CaptureError::Unknown(format!("failed to create scratch directory: {}", e)))?;

        info!(device = %device.id, "Acquired capture device");
        Ok(Box::new(CommandCaptureSource {
            device,
            command: self.command.clone(),
            workdir: Some(workdir),
        }))
    }

    fn name(&self) -> &str {
        "v4l2-command"
    }
}

/// Source that produces frames by running the capture command
pub struct CommandCaptureSource {
    device: DeviceDescriptor,
    command: Vec<String>,
    workdir: Option<TempDir>,
}

#[async_trait]
impl CaptureSource for CommandCaptureSource {
    async fn grab_frame(&mut self) -> Result<Frame, CaptureError> {
        let workdir = self
            .workdir
            .as_ref()
            .ok_or_else(|| CaptureError::Unknown("capture source already released".to_string()))?;
        let output_path = workdir.path().join(FRAME_FILE);
        let output = output_path.to_string_lossy().to_string();

        let args = process::render_args(
            &self.command,
            &[("device", self.device.id.as_str()), ("output", output.as_str())],
        );

        let result = process::run(&args).await.map_err(|e| {
            CaptureError::Unknown(format!("failed to run capture command: {}", e))
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CaptureError::from_signal(&stderr));
        }

        let data = tokio::fs::read(&output_path)
            .await
            .map_err(|e| CaptureError::Unknown(format!("capture produced no frame: {}", e)))?;
        tokio::fs::remove_file(&output_path).await.ok();

        Ok(Frame::new(data, "image/png"))
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if let Some(workdir) = self.workdir.take() {
            workdir
                .close()
                .map_err(|e| CaptureError::Unknown(format!("failed to clean scratch directory: {}", e)))?;
        }
        Ok(())
    }

    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }
}
