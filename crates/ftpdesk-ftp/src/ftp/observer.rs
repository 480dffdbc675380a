//! Protocol event observer injected into each session.
//!
//! The control channel reports every command it writes and every reply it
//! reads; the data-channel manager reports each negotiated passive address.
//! [`LogObserver`] forwards everything to the `log` facade and is what a
//! session uses when the caller supplies nothing else.

use crate::ftp::passive::PassiveAddress;
use crate::ftp::types::FtpResponse;
use std::sync::Arc;

pub trait ProtocolObserver: Send + Sync {
    /// A command line was written. `PASS` arguments arrive redacted.
    fn on_command(&self, _session_id: &str, _command: &str) {}

    /// A complete reply was read.
    fn on_reply(&self, _session_id: &str, _reply: &FtpResponse) {}

    /// A passive data connection was dialed.
    fn on_data_channel(&self, _session_id: &str, _address: &PassiveAddress) {}
}

pub type SharedObserver = Arc<dyn ProtocolObserver>;

/// Default observer: wire traffic at `trace`, data channels at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ProtocolObserver for LogObserver {
    fn on_command(&self, session_id: &str, command: &str) {
        log::trace!("[ftp:{}] >>> {}", session_id, command);
    }

    fn on_reply(&self, session_id: &str, reply: &FtpResponse) {
        log::trace!(
            "[ftp:{}] <<< {}",
            session_id,
            reply.lines.last().map(String::as_str).unwrap_or("")
        );
    }

    fn on_data_channel(&self, session_id: &str, address: &PassiveAddress) {
        log::debug!("[ftp:{}] data channel -> {}", session_id, address);
    }
}

pub fn log_observer() -> SharedObserver {
    Arc::new(LogObserver)
}

/// Hide the argument of a `PASS` command.
pub fn redact(command: &str) -> String {
    if command.get(..4).map_or(false, |verb| verb.eq_ignore_ascii_case("PASS")) {
        "PASS ****".to_string()
    } else {
        command.to_string()
    }
}
