//! Scan session controller
//!
//! [`ScanController`] is an explicit state machine:
//!
//! ```text
//! Idle/Error --start--> Starting --acquired--> Scanning --decoded--> Idle (last_result)
//!                          |                      |---device error--> Error
//!                          +--no device/denied--> Error
//! Starting/Scanning --stop--> Stopping --released--> Idle
//! ```
//!
//! While scanning, a worker task polls the capture source at a fixed interval
//! and submits one frame at a time to the decoder. Each session carries an id in
//! [`SessionState::session`]; a worker may only publish its outcome while the
//! state still belongs to its session and is `Scanning`, so a late result from a
//! stopped session is dropped instead of reviving it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::capture::{CaptureBackend, CaptureError, CaptureGuard, DeviceSelector};
use crate::config::ScannerConfig;
use crate::content::ContentType;
use crate::decode::{DecodeError, Decoder, ImageInput};

/// Lifecycle phase of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Scanning,
    Stopping,
    Error,
}

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    Camera,
    File,
}

/// A successfully decoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub text: String,
    pub content_type: ContentType,
    pub source: ScanSource,
}

impl ScanResult {
    pub fn new(text: impl Into<String>, source: ScanSource) -> Self {
        let text = text.into();
        Self {
            content_type: ContentType::classify(&text),
            text,
            source,
        }
    }
}

/// Errors surfaced to the user
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// Fatal capture failure
    #[error(transparent)]
    Device(#[from] CaptureError),

    /// One-shot image decode failed
    #[error("Could not scan QR code from image. {0}")]
    FileDecode(String),

    /// A payload could not be opened as a URL
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    /// A valid URL could not be handed to the browser
    #[error("Failed to open URL: {0}")]
    OpenFailed(String),

    /// A payload could not be copied
    #[error("Failed to copy to clipboard: {0}")]
    CopyFailed(String),
}

/// Observable controller state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: Phase,
    pub last_result: Option<ScanResult>,
    pub last_error: Option<ScanError>,
    /// Id of the session this state belongs to
    pub session: u64,
}

/// Receives session outcomes
///
/// Called without the controller's lock held, but implementations must not
/// wait on the controller from inside these callbacks.
#[async_trait]
pub trait ScanObserver: Send + Sync {
    /// A symbol was decoded; called once per successful session
    async fn on_result(&self, result: &ScanResult);

    /// A session or file scan failed
    async fn on_error(&self, _error: &ScanError) {}
}

/// Tunables for camera sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub selector: DeviceSelector,
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::Facing("environment".to_string()),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            selector: DeviceSelector::parse(&config.device),
            poll_interval: Duration::from_millis(1000 / u64::from(config.fps.max(1))),
        }
    }
}

struct ActiveSession {
    session: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the scan lifecycle and the capture source
pub struct ScanController {
    backend: Arc<dyn CaptureBackend>,
    decoder: Arc<dyn Decoder>,
    observer: Arc<dyn ScanObserver>,
    settings: SessionSettings,
    state: Arc<watch::Sender<SessionState>>,
    active: Mutex<Option<ActiveSession>>,
}

impl ScanController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        decoder: Arc<dyn Decoder>,
        observer: Arc<dyn ScanObserver>,
        settings: SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            backend,
            decoder,
            observer,
            settings,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Start a camera session, stopping any active one first
    ///
    /// Returns once the capture source is acquired and scanning has begun. A
    /// failure is also recorded in the state and reported to the observer.
    pub async fn start(&self) -> Result<(), ScanError> {
        let mut active = self.active.lock().await;
        self.shutdown(&mut active).await;

        let session = self.begin(Phase::Starting);
        let mut pending = PendingStart {
            state: &self.state,
            session,
            armed: true,
        };
        info!(
            session,
            backend = self.backend.name(),
            selector = %self.settings.selector,
            "Starting scan session"
        );

        let devices = match self.backend.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => return Err(self.fail(session, e.into()).await),
        };
        if devices.is_empty() {
            return Err(self.fail(session, CaptureError::DeviceNotFound.into()).await);
        }

        let source = match self.backend.acquire(&self.settings.selector).await {
            Ok(source) => source,
            Err(e) => return Err(self.fail(session, e.into()).await),
        };
        let guard = CaptureGuard::new(source);

        self.state.send_modify(|s| s.phase = Phase::Scanning);
        pending.armed = false;

        let (stop, stop_rx) = oneshot::channel();
        let worker = SessionWorker {
            session,
            state: Arc::clone(&self.state),
            decoder: Arc::clone(&self.decoder),
            observer: Arc::clone(&self.observer),
            poll_interval: self.settings.poll_interval,
        };
        let task = tokio::spawn(worker.run(guard, stop_rx));

        *active = Some(ActiveSession {
            session,
            stop,
            task,
        });
        Ok(())
    }

    /// Stop the active session; does nothing when there is none
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        self.shutdown(&mut active).await;
    }

    /// Decode a single image, stopping any camera session first
    pub async fn scan_file(&self, image: &ImageInput) -> Result<ScanResult, ScanError> {
        let mut active = self.active.lock().await;
        self.shutdown(&mut active).await;

        let session = self.begin(Phase::Idle);
        info!(session, image = %image.name, "Scanning image");
        let decoded = self.decoder.decode_image(image).await;
        drop(active);

        match decoded {
            Ok(text) => {
                let result = ScanResult::new(text, ScanSource::File);
                self.state
                    .send_modify(|s| s.last_result = Some(result.clone()));
                self.observer.on_result(&result).await;
                Ok(result)
            }
            Err(e) => {
                let error = ScanError::FileDecode(file_failure_hint(&e));
                debug!(session, "Image scan failed: {}", e);
                self.state.send_modify(|s| s.last_error = Some(error.clone()));
                self.observer.on_error(&error).await;
                Err(error)
            }
        }
    }

    /// Reset the state for a new session and return its id
    fn begin(&self, phase: Phase) -> u64 {
        let mut session = 0;
        self.state.send_modify(|s| {
            s.session += 1;
            s.phase = phase;
            s.last_result = None;
            s.last_error = None;
            session = s.session;
        });
        session
    }

    async fn fail(&self, session: u64, error: ScanError) -> ScanError {
        warn!(session, "Scan session failed: {}", error);
        self.state.send_modify(|s| {
            s.phase = Phase::Error;
            s.last_error = Some(error.clone());
        });
        self.observer.on_error(&error).await;
        error
    }

    /// Stop the worker and wait until it has released the capture source
    async fn shutdown(&self, active: &mut Option<ActiveSession>) {
        let Some(current) = active.take() else {
            return;
        };

        let stopping = self.state.send_if_modified(|s| {
            if s.session == current.session
                && matches!(s.phase, Phase::Starting | Phase::Scanning)
            {
                s.phase = Phase::Stopping;
                true
            } else {
                false
            }
        });

        // The worker may already have finished and dropped its receiver
        let _ = current.stop.send(());
        if let Err(e) = current.task.await {
            warn!(session = current.session, "Scan worker ended abnormally: {}", e);
        }

        if stopping {
            self.state.send_if_modified(|s| {
                if s.phase == Phase::Stopping {
                    s.phase = Phase::Idle;
                    true
                } else {
                    false
                }
            });
            info!(session = current.session, "Scan session stopped");
        }
    }
}

/// Returns a cancelled `start` to `Idle`
///
/// If the `start` future is dropped while enumerating or acquiring, no session
/// is registered for `stop` to find, so the `Starting` phase is undone here.
struct PendingStart<'a> {
    state: &'a watch::Sender<SessionState>,
    session: u64,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session = self.session;
        let reset = self.state.send_if_modified(|s| {
            if s.session == session && s.phase == Phase::Starting {
                s.phase = Phase::Idle;
                true
            } else {
                false
            }
        });
        if reset {
            debug!(session, "Scan session start cancelled");
        }
    }
}

fn file_failure_hint(error: &DecodeError) -> String {
    match error {
        DecodeError::NotFound => {
            "Ensure the image is clear and contains a valid QR code.".to_string()
        }
        DecodeError::Unreadable(reason) => reason.clone(),
    }
}

enum FrameOutcome {
    Miss,
    Decoded(String),
    Failed(CaptureError),
}

/// Background half of a camera session
struct SessionWorker {
    session: u64,
    state: Arc<watch::Sender<SessionState>>,
    decoder: Arc<dyn Decoder>,
    observer: Arc<dyn ScanObserver>,
    poll_interval: Duration,
}

impl SessionWorker {
    async fn run(self, mut guard: CaptureGuard, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses: u64 = 0;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break None,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = &mut stop => break None,
                outcome = self.poll(&mut guard) => outcome,
            };

            match outcome {
                FrameOutcome::Miss => misses += 1,
                done => break Some(done),
            }
        };

        guard.release();
        trace!(session = self.session, misses, "Scan loop finished");

        match outcome {
            None => debug!(session = self.session, "Scan loop cancelled"),
            Some(FrameOutcome::Decoded(text)) => self.finish_with_result(text).await,
            Some(FrameOutcome::Failed(e)) => self.finish_with_error(e.into()).await,
            Some(FrameOutcome::Miss) => {}
        }
    }

    async fn poll(&self, guard: &mut CaptureGuard) -> FrameOutcome {
        let frame = match guard.grab_frame().await {
            Ok(frame) => frame,
            Err(e) => return FrameOutcome::Failed(e),
        };

        match self.decoder.decode_frame(&frame).await {
            Ok(text) => FrameOutcome::Decoded(text),
            Err(e) => {
                if !e.is_miss() {
                    debug!(session = self.session, "Skipping undecodable frame: {}", e);
                }
                FrameOutcome::Miss
            }
        }
    }

    async fn finish_with_result(&self, text: String) {
        let result = ScanResult::new(text, ScanSource::Camera);
        let applied = self.state.send_if_modified(|s| {
            if s.session != self.session || s.phase != Phase::Scanning {
                return false;
            }
            s.phase = Phase::Idle;
            s.last_result = Some(result.clone());
            s.last_error = None;
            true
        });

        if !applied {
            debug!(session = self.session, "Discarding result from a stopped session");
            return;
        }

        info!(session = self.session, content_type = %result.content_type, "QR code decoded");
        self.observer.on_result(&result).await;
    }

    async fn finish_with_error(&self, error: ScanError) {
        let applied = self.state.send_if_modified(|s| {
            if s.session != self.session || s.phase != Phase::Scanning {
                return false;
            }
            s.phase = Phase::Error;
            s.last_error = Some(error.clone());
            true
        });

        if applied {
            warn!(session = self.session, "Scan session failed: {}", error);
            self.observer.on_error(&error).await;
        }
    }
}
