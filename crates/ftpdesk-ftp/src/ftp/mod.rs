//! # ftpdesk-ftp: passive-mode FTP client engine
//!
//! RFC 959 control protocol over TCP with passive (PASV) data channels,
//! plus resumable, cancellable `RETR` with throttled progress events.
//!
//! Architecture:
//! - `types`: config, session info, transfer status, replies
//! - `error`: FTP-specific error type
//! - `observer`: injected protocol observer (`LogObserver` by default)
//! - `protocol`: reply reader (single- and multi-line replies)
//! - `control`: control connection: greeting, command/reply pairing, login
//! - `passive`: PASV reply decoding
//! - `data`: one data connection per operation, establish/release
//! - `cancel`: cooperative cancellation handle/signal
//! - `progress`: progress throttle and non-blocking delivery
//! - `transfer`: resumable RETR job
//! - `session`: LIST, STOR, RETR, MKD, RMD/DELE, TYPE, SIZE, NOOP
//! - `service`: caller-facing orchestrator for one session

pub mod types;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod control;
pub mod passive;
pub mod data;
pub mod cancel;
pub mod progress;
pub mod transfer;
pub mod session;
pub mod service;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use observer::{log_observer, LogObserver, ProtocolObserver, SharedObserver};
pub use passive::{parse_pasv_response, PassiveAddress};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use progress::{ProgressSink, ProgressThrottle};
pub use transfer::{TransferJob, TransferOptions};
pub use session::Session;
pub use service::{FtpService, FtpServiceState};
