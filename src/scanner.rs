//! Scan service: records session results into the history
//!
//! [`ScanService`] is the [`ScanObserver`] handed to the controller. Every
//! decoded payload becomes a [`HistoryItem`], flagged when verification mode is
//! active, and is announced to subscribers as a [`ScanEvent`]. In verification
//! mode decoded links are opened after a short delay through a [`RedirectHook`].
//! With a clipboard attached, payloads can also be copied as they are scanned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::clipboard::ClipboardProvider;
use crate::config::VerificationConfig;
use crate::content::parse_url;
use crate::history::{HistoryItem, HistoryStore};
use crate::process;
use crate::session::{ScanError, ScanObserver, ScanResult};

const EVENT_CAPACITY: usize = 16;

/// Notifications published by the service
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A result was stored in the history
    Recorded(HistoryItem),
    /// A result was decoded but the history write failed
    Unrecorded { result: ScanResult, reason: String },
    /// A session or image scan failed
    Failed(ScanError),
    /// A non-fatal problem with a recorded result
    Notice(ScanError),
    /// A link was opened in the browser
    Opened(Url),
    /// A payload was copied to the clipboard
    Copied,
}

/// Opens links outside the process
#[async_trait]
pub trait RedirectHook: Send + Sync {
    async fn open(&self, url: &Url) -> std::io::Result<()>;
}

/// Opens links with the desktop's default browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

#[cfg(target_os = "macos")]
const OPENER: &str = "open";
#[cfg(not(target_os = "macos"))]
const OPENER: &str = "xdg-open";

#[async_trait]
impl RedirectHook for SystemBrowser {
    async fn open(&self, url: &Url) -> std::io::Result<()> {
        let output = process::run(&[OPENER.to_string(), url.to_string()]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Validate a payload as a URL that may be opened
pub fn validate_url(text: &str) -> Result<Url, ScanError> {
    parse_url(text).map_err(|e| ScanError::InvalidUrl(format!("{}: {}", text.trim(), e)))
}

/// Glues scan sessions to the history
pub struct ScanService {
    history: Arc<HistoryStore>,
    verification: VerificationConfig,
    redirect: Arc<dyn RedirectHook>,
    clipboard: Option<Arc<dyn ClipboardProvider>>,
    copy_on_scan: bool,
    events: broadcast::Sender<ScanEvent>,
    pending_redirect: Mutex<Option<JoinHandle<()>>>,
}

impl ScanService {
    pub fn new(
        history: Arc<HistoryStore>,
        verification: VerificationConfig,
        redirect: Arc<dyn RedirectHook>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            history,
            verification,
            redirect,
            clipboard: None,
            copy_on_scan: false,
            events,
            pending_redirect: Mutex::new(None),
        }
    }

    /// Attach a clipboard; with `copy_on_scan` every recorded payload is copied
    pub fn with_clipboard(
        mut self,
        clipboard: Arc<dyn ClipboardProvider>,
        copy_on_scan: bool,
    ) -> Self {
        self.clipboard = Some(clipboard);
        self.copy_on_scan = copy_on_scan;
        self
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn verification(&self) -> &VerificationConfig {
        &self.verification
    }

    /// Receiver for events published after subscribing
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Validate `text` and open it through the redirect hook
    pub async fn open_url(&self, text: &str) -> Result<Url, ScanError> {
        let url = validate_url(text)?;
        open_with(self.redirect.as_ref(), &url, &self.events).await?;
        Ok(url)
    }

    /// Copy `text` to the attached clipboard
    pub async fn copy_text(&self, text: &str) -> Result<(), ScanError> {
        let clipboard = self
            .clipboard
            .as_ref()
            .ok_or_else(|| ScanError::CopyFailed("no clipboard available".to_string()))?;

        match clipboard.set_text(text).await {
            Ok(()) => {
                debug!(provider = clipboard.name(), "Copied payload");
                self.publish(ScanEvent::Copied);
                Ok(())
            }
            Err(e) => {
                warn!(provider = clipboard.name(), "Failed to copy payload: {}", e);
                Err(ScanError::CopyFailed(e.to_string()))
            }
        }
    }

    /// Wait for a scheduled redirect to complete
    pub async fn flush(&self) {
        let pending = self.pending_redirect.lock().await.take();
        if let Some(task) = pending {
            if let Err(e) = task.await {
                warn!("Redirect task ended abnormally: {}", e);
            }
        }
    }

    fn publish(&self, event: ScanEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn schedule_redirect(&self, text: &str) {
        let url = match validate_url(text) {
            Ok(url) => url,
            Err(e) => {
                warn!("Not opening scanned link: {}", e);
                self.publish(ScanEvent::Notice(e));
                return;
            }
        };

        let delay = Duration::from_millis(self.verification.redirect_delay_ms);
        let redirect = Arc::clone(&self.redirect);
        let events = self.events.clone();
        info!(url = %url, delay_ms = self.verification.redirect_delay_ms, "Opening verification link");

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = open_with(redirect.as_ref(), &url, &events).await {
                let _ = events.send(ScanEvent::Notice(e));
            }
        });

        let previous = self.pending_redirect.lock().await.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn open_with(
    redirect: &dyn RedirectHook,
    url: &Url,
    events: &broadcast::Sender<ScanEvent>,
) -> Result<(), ScanError> {
    match redirect.open(url).await {
        Ok(()) => {
            debug!(url = %url, "Opened link");
            let _ = events.send(ScanEvent::Opened(url.clone()));
            Ok(())
        }
        Err(e) => {
            warn!(url = %url, "Failed to open link: {}", e);
            Err(ScanError::OpenFailed(e.to_string()))
        }
    }
}

#[async_trait]
impl ScanObserver for ScanService {
    async fn on_result(&self, result: &ScanResult) {
        let flagged = self.verification.enabled;
        match self
            .history
            .add(result.text.clone(), result.content_type, flagged)
            .await
        {
            Ok(item) => self.publish(ScanEvent::Recorded(item)),
            Err(e) => {
                warn!("Failed to record scan: {}", e);
                self.publish(ScanEvent::Unrecorded {
                    result: result.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if self.copy_on_scan {
            if let Err(e) = self.copy_text(&result.text).await {
                self.publish(ScanEvent::Notice(e));
            }
        }

        if flagged && self.verification.auto_open_urls && result.content_type.is_link() {
            self.schedule_redirect(&result.text).await;
        }
    }

    async fn on_error(&self, error: &ScanError) {
        self.publish(ScanEvent::Failed(error.clone()));
    }
}
