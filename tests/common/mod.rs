//! Scriptable capture, decoder and observer fakes shared by integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qrscan::capture::{
    CaptureBackend, CaptureError, CaptureSource, DeviceDescriptor, DeviceSelector, Frame,
};
use qrscan::decode::{DecodeError, Decoder, ImageInput};
use qrscan::session::{
    ScanController, ScanError, ScanObserver, ScanResult, SessionSettings, SessionState,
};

/// What the next grabbed frame looks like
#[derive(Debug, Clone)]
pub enum Step {
    /// A frame with no symbol
    Blank,
    /// A frame whose symbol decodes to the text
    Payload(String),
    /// The grab fails
    Fail(CaptureError),
}

/// Shared record of acquire/release calls, in order
#[derive(Default)]
pub struct Ledger {
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub log: Mutex<Vec<String>>,
}

impl Ledger {
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

pub struct FakeBackend {
    pub devices: Vec<DeviceDescriptor>,
    pub acquire_error: Option<CaptureError>,
    pub acquire_delay: Option<Duration>,
    pub steps: Arc<Mutex<VecDeque<Step>>>,
    pub ledger: Arc<Ledger>,
}

impl FakeBackend {
    pub fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            devices: vec![DeviceDescriptor {
                id: "/dev/video0".to_string(),
                label: "video0".to_string(),
            }],
            acquire_error: None,
            acquire_delay: None,
            steps: Arc::new(Mutex::new(steps.into())),
            ledger: Arc::new(Ledger::default()),
        }
    }

    pub fn without_devices() -> Self {
        Self {
            devices: Vec::new(),
            ..Self::with_steps(Vec::new())
        }
    }
}

#[async_trait]
impl CaptureBackend for FakeBackend {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self.devices.clone())
    }

    async fn acquire(
        &self,
        _selector: &DeviceSelector,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.acquire_error {
            return Err(error.clone());
        }
        let n = self.ledger.acquires.fetch_add(1, Ordering::SeqCst) + 1;
        self.ledger.log.lock().unwrap().push(format!("acquire:{}", n));

        Ok(Box::new(FakeSource {
            n,
            device: self.devices[0].clone(),
            steps: Arc::clone(&self.steps),
            ledger: Arc::clone(&self.ledger),
            released: false,
        }))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FakeSource {
    n: usize,
    device: DeviceDescriptor,
    steps: Arc<Mutex<VecDeque<Step>>>,
    ledger: Arc<Ledger>,
    released: bool,
}

#[async_trait]
impl CaptureSource for FakeSource {
    async fn grab_frame(&mut self) -> Result<Frame, CaptureError> {
        assert!(!self.released, "frame grabbed after release");
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Blank);
        match step {
            Step::Blank => Ok(Frame::new(Vec::new(), "image/png")),
            Step::Payload(text) => Ok(Frame::new(text.into_bytes(), "image/png")),
            Step::Fail(e) => Err(e),
        }
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if !self.released {
            self.released = true;
            self.ledger.releases.fetch_add(1, Ordering::SeqCst);
            self.ledger.log.lock().unwrap().push(format!("release:{}", self.n));
        }
        Ok(())
    }

    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }
}

/// Decodes frame bytes as UTF-8; empty data holds no symbol
#[derive(Default)]
pub struct FakeDecoder {
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeDecoder {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn decode(&self, data: &[u8]) -> Result<String, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::NotFound);
        }
        String::from_utf8(data.to_vec()).map_err(|e| DecodeError::Unreadable(e.to_string()))
    }
}

#[async_trait]
impl Decoder for FakeDecoder {
    async fn decode_frame(&self, frame: &Frame) -> Result<String, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.decode(&frame.data)
    }

    async fn decode_image(&self, image: &ImageInput) -> Result<String, DecodeError> {
        self.decode(&image.data)
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub results: Mutex<Vec<ScanResult>>,
    pub errors: Mutex<Vec<ScanError>>,
}

impl RecordingObserver {
    pub fn results(&self) -> Vec<ScanResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ScanError> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanObserver for RecordingObserver {
    async fn on_result(&self, result: &ScanResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    async fn on_error(&self, error: &ScanError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(1),
        ..SessionSettings::default()
    }
}

pub struct Harness {
    pub controller: ScanController,
    pub ledger: Arc<Ledger>,
    pub observer: Arc<RecordingObserver>,
}

pub fn harness(backend: FakeBackend, decoder: FakeDecoder) -> Harness {
    let ledger = Arc::clone(&backend.ledger);
    let observer = Arc::new(RecordingObserver::default());
    let controller = ScanController::new(
        Arc::new(backend),
        Arc::new(decoder),
        observer.clone(),
        fast_settings(),
    );
    Harness {
        controller,
        ledger,
        observer,
    }
}

/// Wait until the controller state satisfies `done`
pub async fn wait_for_state(
    controller: &ScanController,
    done: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut rx = controller.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(done))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
    state.clone()
}

/// Poll `check` until it holds or the timeout elapses
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
