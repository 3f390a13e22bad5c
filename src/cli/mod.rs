use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::capture::{CaptureBackend, CommandCaptureBackend, DeviceSelector};
use crate::clipboard::SystemClipboard;
use crate::config::Config;
use crate::content::{format_timestamp, ContentType};
use crate::decode::{CommandDecoder, ImageInput};
use crate::history::{HistoryItem, HistoryStore};
use crate::scanner::{ScanEvent, ScanService, SystemBrowser};
use crate::session::{ScanController, SessionSettings};
use crate::storage;

const PREVIEW_CHARS: usize = 60;

#[derive(Parser)]
#[command(name = "qrscan")]
#[command(about = "Scan QR codes from a camera or an image and keep a history")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Flag scans as verification scans and open decoded links
    #[arg(long, global = true)]
    pub verify: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Scan a QR code with the camera or from an image file")]
    Scan {
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Camera to use: environment, user, default or a device path
        #[arg(short, long)]
        device: Option<String>,

        /// Copy the decoded payload to the clipboard
        #[arg(long)]
        copy: bool,
    },

    #[command(about = "Show scan history")]
    History {
        #[arg(short, long, default_value = "10")]
        limit: usize,

        #[arg(short, long)]
        search: Option<String>,
    },

    #[command(about = "Delete a history item")]
    Delete { id: String },

    #[command(about = "Delete all history items")]
    Clear {
        #[arg(long)]
        yes: bool,
    },

    #[command(about = "Open the link stored in a history item")]
    Open { id: String },

    #[command(about = "Copy a history item's payload to the clipboard")]
    Copy { id: String },

    #[command(about = "Show the content type of a payload")]
    Classify { text: String },

    #[command(about = "List capture devices")]
    Devices,

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config: Arc<Config>,
    config_path: Option<PathBuf>,
    history: Option<Arc<HistoryStore>>,
}

impl CliHandler {
    /// Create a handler; `verify` forces verification mode on
    pub fn new(mut config: Config, config_path: Option<PathBuf>, verify: bool) -> Self {
        if verify {
            config.verification.enabled = true;
        }

        Self {
            config: Arc::new(config),
            config_path,
            history: None,
        }
    }

    /// Lazily open the history store when needed
    fn ensure_history(&mut self) -> Result<Arc<HistoryStore>> {
        if let Some(history) = &self.history {
            return Ok(Arc::clone(history));
        }

        info!("Opening scan history");
        let backend = storage::open(&self.config.history).with_context(|| {
            format!(
                "Failed to open history at {}",
                self.config.history.path.display()
            )
        })?;
        let history = Arc::new(HistoryStore::load_with_key(
            backend,
            self.config.history.storage_key.clone(),
        ));
        self.history = Some(Arc::clone(&history));
        Ok(history)
    }

    fn scan_service(&mut self, copy_on_scan: bool) -> Result<Arc<ScanService>> {
        let history = self.ensure_history()?;
        let service = ScanService::new(
            history,
            self.config.verification.clone(),
            Arc::new(SystemBrowser),
        )
        .with_clipboard(
            Arc::new(SystemClipboard),
            copy_on_scan || self.config.scanner.copy_to_clipboard,
        );
        Ok(Arc::new(service))
    }

    fn capture_backend(&self) -> Arc<dyn CaptureBackend> {
        Arc::new(CommandCaptureBackend::from_config(&self.config.scanner))
    }

    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Scan {
                image,
                device,
                copy,
            } => self.scan(image, device, copy).await,
            Commands::History { limit, search } => self.show_history(limit, search).await,
            Commands::Delete { id } => self.delete_item(&id).await,
            Commands::Clear { yes } => self.clear_history(yes).await,
            Commands::Open { id } => self.open_item(&id).await,
            Commands::Copy { id } => self.copy_item(&id).await,
            Commands::Classify { text } => {
                println!("{}", ContentType::classify(&text));
                Ok(())
            }
            Commands::Devices => self.list_devices().await,
            Commands::Config { action } => self.handle_config_action(action),
        }
    }

    async fn scan(
        &mut self,
        image: Option<PathBuf>,
        device: Option<String>,
        copy: bool,
    ) -> Result<()> {
        let service = self.scan_service(copy)?;
        if service.verification().enabled {
            println!("Verification mode: recorded scans are flagged");
        }
        let mut settings = SessionSettings::from_config(&self.config.scanner);
        if let Some(device) = device {
            settings.selector = DeviceSelector::parse(&device);
        }

        let controller = ScanController::new(
            self.capture_backend(),
            Arc::new(CommandDecoder::from_config(&self.config.scanner)),
            service.clone(),
            settings,
        );
        let mut events = service.subscribe();

        match image {
            Some(path) => {
                let input = ImageInput::from_path(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                controller.scan_file(&input).await?;
            }
            None => {
                controller.start().await?;
                println!(
                    "Scanning with {} camera, press Ctrl-C to stop",
                    controller.settings().selector
                );
            }
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ScanEvent::Recorded(item)) => {
                        println!("{}", item.data);
                        println!("  type: {}  id: {}", item.content_type, item.id);
                        break;
                    }
                    Ok(ScanEvent::Unrecorded { result, reason }) => {
                        println!("{}", result.text);
                        println!("  type: {}  (not saved: {})", result.content_type, reason);
                        break;
                    }
                    Ok(ScanEvent::Failed(e)) => return Err(e.into()),
                    Ok(other) => report_event(&other),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Missed scan events"),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut ctrl_c => {
                    controller.stop().await;
                    println!("Scan cancelled");
                    return Ok(());
                }
            }
        }

        service.flush().await;
        while let Ok(event) = events.try_recv() {
            report_event(&event);
        }
        Ok(())
    }

    async fn show_history(&mut self, limit: usize, search: Option<String>) -> Result<()> {
        let history = self.ensure_history()?;
        let items = match &search {
            Some(term) => history.search(term).await,
            None => history.items().await,
        };

        if items.is_empty() {
            match search {
                Some(term) => println!("No scans matching \"{}\"", term),
                None => println!("No scan history found"),
            }
            return Ok(());
        }

        println!("Scan History (showing {} of {}):", items.len().min(limit), items.len());
        for item in items.iter().take(limit) {
            println!("{}", format_item(item));
        }

        Ok(())
    }

    async fn delete_item(&mut self, id: &str) -> Result<()> {
        let history = self.ensure_history()?;
        if history.delete(id).await? {
            println!("Deleted {}", id);
        } else {
            println!("No history item with id {}", id);
        }
        Ok(())
    }

    async fn clear_history(&mut self, yes: bool) -> Result<()> {
        if !yes {
            bail!("Refusing to clear the scan history without --yes");
        }
        let history = self.ensure_history()?;
        history.clear().await?;
        println!("Scan history cleared");
        Ok(())
    }

    async fn open_item(&mut self, id: &str) -> Result<()> {
        let service = self.scan_service(false)?;
        let item = service
            .history()
            .get(id)
            .await
            .ok_or_else(|| anyhow!("No history item with id {}", id))?;
        if !item.content_type.is_link() {
            bail!(
                "History item {} is {} content, not a link",
                id,
                item.content_type
            );
        }

        let url = service.open_url(&item.data).await?;
        println!("Opened {}", url);
        Ok(())
    }

    async fn copy_item(&mut self, id: &str) -> Result<()> {
        let service = self.scan_service(false)?;
        let item = service
            .history()
            .get(id)
            .await
            .ok_or_else(|| anyhow!("No history item with id {}", id))?;

        service.copy_text(&item.data).await?;
        println!("Copied to clipboard");
        Ok(())
    }

    async fn list_devices(&self) -> Result<()> {
        let backend = self.capture_backend();
        let devices = backend.enumerate_devices().await?;

        if devices.is_empty() {
            println!("No capture devices found");
            return Ok(());
        }

        println!("Capture devices ({}):", devices.len());
        for device in devices {
            println!("  {} ({})", device.label, device.id);
        }
        Ok(())
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("Current Configuration:");
                println!("{}", toml::to_string_pretty(self.config.as_ref())?);
            }
            ConfigAction::Init { force } => {
                let path = self
                    .config_path
                    .clone()
                    .or_else(Config::default_path)
                    .ok_or_else(|| anyhow!("Could not determine config directory"))?;
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                self.config.validate()?;
                println!("Configuration is valid");
            }
        }
        Ok(())
    }
}

fn report_event(event: &ScanEvent) {
    match event {
        ScanEvent::Notice(e) => eprintln!("warning: {}", e),
        ScanEvent::Opened(url) => println!("Opened {}", url),
        ScanEvent::Copied => println!("Copied to clipboard"),
        _ => {}
    }
}

/// One history line: id, time, type, verification flag and a payload preview
fn format_item(item: &HistoryItem) -> String {
    let flat = item.data.replace(['\r', '\n'], " ");
    let mut preview: String = flat.chars().take(PREVIEW_CHARS).collect();
    if flat.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }

    format!(
        "{}  {}  [{}]{}  {}",
        item.id,
        format_timestamp(item.timestamp),
        item.content_type,
        if item.flagged { " (verified)" } else { "" },
        preview
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(data: &str, flagged: bool) -> HistoryItem {
        HistoryItem {
            id: "abc".to_string(),
            data: data.to_string(),
            content_type: ContentType::classify(data),
            timestamp: 0,
            flagged,
        }
    }

    #[test]
    fn test_parse_scan_image() {
        let cli = Cli::try_parse_from(["qrscan", "--verify", "scan", "--image", "code.png"]).unwrap();
        assert!(cli.verify);
        match cli.command {
            Commands::Scan {
                image,
                device,
                copy,
            } => {
                assert_eq!(image, Some(PathBuf::from("code.png")));
                assert!(device.is_none());
                assert!(!copy);
            }
            _ => panic!("expected scan"),
        }
    }

    #[test]
    fn test_parse_history_defaults() {
        let cli = Cli::try_parse_from(["qrscan", "history", "-s", "example"]).unwrap();
        match cli.command {
            Commands::History { limit, search } => {
                assert_eq!(limit, 10);
                assert_eq!(search.as_deref(), Some("example"));
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["qrscan", "devices", "--verbose", "-c", "/tmp/q.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/q.toml")));
    }

    #[test]
    fn test_parse_copy_commands() {
        let cli = Cli::try_parse_from(["qrscan", "scan", "--copy"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { copy: true, .. }));

        let cli = Cli::try_parse_from(["qrscan", "copy", "abc"]).unwrap();
        match cli.command {
            Commands::Copy { id } => assert_eq!(id, "abc"),
            _ => panic!("expected copy"),
        }
        assert!(Cli::try_parse_from(["qrscan", "copy"]).is_err());
    }

    #[test]
    fn test_delete_requires_id() {
        assert!(Cli::try_parse_from(["qrscan", "delete"]).is_err());
    }

    #[test]
    fn test_verify_flag_enables_verification() {
        let handler = CliHandler::new(Config::default(), None, true);
        assert!(handler.config.verification.enabled);
    }

    #[test]
    fn test_format_item_flattens_and_truncates() {
        let long = format!("BEGIN:VCARD\nFN:{}\nEND:VCARD", "x".repeat(100));
        let line = format_item(&item(&long, true));
        assert!(line.contains("[contact] (verified)"));
        assert!(line.ends_with("..."));
        assert!(!line.contains('\n'));

        let line = format_item(&item("tel:123", false));
        assert!(line.ends_with("[tel]  tel:123"));
    }

    #[tokio::test]
    async fn test_clear_requires_confirmation() {
        let mut handler = CliHandler::new(Config::default(), None, false);
        assert!(handler.clear_history(false).await.is_err());
    }
}
