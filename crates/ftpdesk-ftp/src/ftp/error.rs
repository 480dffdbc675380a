//! FTP-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP response code that triggered the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP dial failure or a greeting other than 220.
    ConnectionFailed,
    /// Credentials rejected.
    AuthFailed,
    /// Unexpected reply code or an un-parseable reply (e.g. bad PASV).
    ProtocolError,
    /// Socket or file read/write failure.
    IoError,
    /// Local file could not be opened or created.
    FileError,
    /// Operation stopped at the caller's request.
    Cancelled,
    /// Dial, reply or data read deadline elapsed.
    Timeout,
    /// Control channel closed or no longer usable.
    Disconnected,
    /// Operation issued in the wrong session or job state.
    InvalidState,
    /// Config / parameter validation error.
    InvalidConfig,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn file_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::FileError, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidState, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn not_connected() -> Self {
        Self::invalid_state("Not connected")
    }

    /// Classify an unexpected FTP reply into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            530 => FtpErrorKind::AuthFailed,
            _ => FtpErrorKind::ProtocolError,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}
