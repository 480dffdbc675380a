//! Control connection: dial, greeting, command/reply pairing, login.
//!
//! Replies are matched to commands purely by order, so the channel keeps
//! two pieces of bookkeeping:
//! - `owed_replies`: completion replies the server still owes for an
//!   accepted transfer command (RETR/STOR/LIST answered with 1xx). They are
//!   consumed by the data-channel release, or drained before the next
//!   command if a caller path skipped the release.
//! - `broken`: set after any failed write or read. Once set, every command
//!   fails with `Disconnected` instead of reading a reply that may belong
//!   to an earlier command.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::observer::{redact, SharedObserver};
use crate::ftp::protocol::ResponseReader;
use crate::ftp::types::{FtpResponse, TransferType};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Reply timeout used for the farewell `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ControlChannel {
    session_id: String,
    reader: ResponseReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    observer: SharedObserver,
    reply_timeout: Duration,
    peer: Option<IpAddr>,
    owed_replies: usize,
    broken: bool,
}

impl ControlChannel {
    /// Open the control connection and consume the greeting.
    ///
    /// Fails with `ConnectionFailed` unless the greeting code is 220
    /// (a `120` "ready in n minutes" notice is skipped).
    pub async fn dial(
        address: &str,
        connect_timeout: Duration,
        reply_timeout: Duration,
        session_id: &str,
        observer: SharedObserver,
    ) -> FtpResult<(Self, FtpResponse)> {
        let tcp = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| FtpError::connection_failed(format!("TCP connect to {} timed out", address)))?
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", address, e)))?;
        tcp.set_nodelay(true).ok();
        let peer = tcp.peer_addr().ok().map(|a| a.ip());

        let (rd, wr) = tcp.into_split();
        let mut channel = Self {
            session_id: session_id.to_string(),
            reader: ResponseReader::new(BufReader::new(rd)),
            writer: wr,
            observer,
            reply_timeout,
            peer,
            owed_replies: 0,
            broken: false,
        };

        let mut greeting = channel
            .read_response_within(connect_timeout)
            .await
            .map_err(|e| FtpError::connection_failed(format!("Reading greeting: {}", e.message)))?;
        if greeting.code == 120 {
            greeting = channel
                .read_response_within(connect_timeout)
                .await
                .map_err(|e| FtpError::connection_failed(format!("Reading greeting: {}", e.message)))?;
        }
        if greeting.code != 220 {
            return Err(
                FtpError::connection_failed(format!("Server not ready: {}", greeting.text()))
                    .with_code(greeting.code),
            );
        }

        log::debug!("[ftp:{}] control channel open to {}", session_id, address);
        Ok((channel, greeting))
    }

    // ─── Command / reply ─────────────────────────────────────────

    /// Send one command and return its reply.
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.ensure_usable()?;
        self.settle().await?;
        self.write_line(cmd).await?;
        self.read_response().await
    }

    /// Send a command and require one of the `expected` reply codes.
    pub async fn expect(&mut self, cmd: &str, expected: &[u16]) -> FtpResult<FtpResponse> {
        let resp = self.send_command(cmd).await?;
        if !expected.contains(&resp.code) {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    /// `USER` then `PASS`; the session is authenticated only on `230`.
    pub async fn login(&mut self, username: &str, password: &str) -> FtpResult<()> {
        let user_resp = self.send_command(&format!("USER {}", username)).await?;
        match user_resp.code {
            230 => return Ok(()),
            331 | 332 => {}
            code => {
                return Err(FtpError::auth_failed(user_resp.text()).with_code(code));
            }
        }

        let pass_resp = self.send_command(&format!("PASS {}", password)).await?;
        if pass_resp.code != 230 {
            return Err(FtpError::auth_failed(pass_resp.text()).with_code(pass_resp.code));
        }
        Ok(())
    }

    /// Best-effort `TYPE A` after a byte transfer. Skipped once the channel
    /// is broken; a refusal is logged, not returned.
    pub(crate) async fn restore_ascii(&mut self) {
        if self.broken {
            return;
        }
        if let Err(e) = self.expect(TransferType::Ascii.command(), &[200]).await {
            log::warn!("[ftp:{}] could not restore ascii mode: {}", self.session_id, e);
        }
    }

    /// Read the next reply from the server.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        self.read_response_within(self.reply_timeout).await
    }

    async fn read_response_within(&mut self, limit: Duration) -> FtpResult<FtpResponse> {
        self.ensure_usable()?;
        let result = match timeout(limit, self.reader.read_response()).await {
            Ok(r) => r,
            Err(_) => Err(FtpError::timeout(format!(
                "No reply within {}s",
                limit.as_secs_f32()
            ))),
        };
        match result {
            Ok(resp) => {
                self.observer.on_reply(&self.session_id, &resp);
                Ok(resp)
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    async fn write_line(&mut self, cmd: &str) -> FtpResult<()> {
        if cmd.contains('\r') || cmd.contains('\n') {
            return Err(FtpError::invalid_config("Command must not contain a line break"));
        }
        let line = format!("{}\r\n", cmd);
        if let Err(e) = self.writer.write_all(line.as_bytes()).await {
            self.broken = true;
            return Err(e.into());
        }
        self.observer.on_command(&self.session_id, &redact(cmd));
        Ok(())
    }

    // ─── Owed completion replies ─────────────────────────────────

    /// Record that the server will send one more reply for an accepted
    /// transfer command.
    pub(crate) fn owe_reply(&mut self) {
        self.owed_replies += 1;
    }

    pub fn owed_replies(&self) -> usize {
        self.owed_replies
    }

    /// Consume one owed completion reply, if any.
    pub(crate) async fn take_owed_reply(&mut self) -> FtpResult<Option<FtpResponse>> {
        if self.owed_replies == 0 {
            return Ok(None);
        }
        self.owed_replies -= 1;
        self.read_response().await.map(Some)
    }

    /// Drain every owed reply so the next command gets its own reply.
    async fn settle(&mut self) -> FtpResult<()> {
        while self.owed_replies > 0 {
            log::warn!(
                "[ftp:{}] draining {} unread completion repl{} before next command",
                self.session_id,
                self.owed_replies,
                if self.owed_replies == 1 { "y" } else { "ies" }
            );
            self.take_owed_reply().await?;
        }
        Ok(())
    }

    // ─── State ───────────────────────────────────────────────────

    fn ensure_usable(&self) -> FtpResult<()> {
        if self.broken {
            return Err(FtpError::disconnected(
                "Control channel is no longer usable after an earlier failure",
            ));
        }
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// IP of the server end of the control connection.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    /// Best-effort `QUIT`, then shut the socket. Never fails.
    pub async fn close(mut self) {
        if !self.broken && self.owed_replies == 0 && self.write_line("QUIT").await.is_ok() {
            let _ = self.read_response_within(QUIT_TIMEOUT).await;
        }
        let _ = self.writer.shutdown().await;
        log::debug!("[ftp:{}] control channel closed", self.session_id);
    }
}
