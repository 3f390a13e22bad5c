//! # QRScan
//!
//! QR code scanning core: a camera session state machine that owns the capture
//! device and decodes frames until it finds a symbol, one-shot image decoding,
//! and a bounded, persisted history of everything scanned.
//!
//! The camera and the decoder are capabilities behind the
//! [`capture::CaptureBackend`] and [`decode::Decoder`] traits; the default
//! implementations drive external tools.

pub mod capture;
pub mod cli;
pub mod clipboard;
pub mod config;
pub mod content;
pub mod decode;
pub mod history;
pub mod process;
pub mod scanner;
pub mod session;
pub mod storage;

pub use config::Config;
pub use content::ContentType;
pub use history::{HistoryItem, HistoryStore};
pub use scanner::{ScanEvent, ScanService};
pub use session::{Phase, ScanController, ScanError, ScanResult, SessionState};

/// Result type alias for QRScan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for QRScan operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// History error
    #[error("History error: {0}")]
    History(#[from] history::HistoryError),

    /// Scan error
    #[error("Scan error: {0}")]
    Scan(#[from] session::ScanError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
