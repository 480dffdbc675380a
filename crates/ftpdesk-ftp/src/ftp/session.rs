//! Stateful FTP session: owns the control channel and the data-channel
//! manager and issues the directory and transfer commands.
//!
//! Lifecycle: `dial()` (greeting 220) → `login()` (230) → operations →
//! `close()`. A session is driven by one caller at a time; every method
//! takes `&mut self`.

use crate::ftp::cancel::CancelSignal;
use crate::ftp::control::ControlChannel;
use crate::ftp::data::DataChannelManager;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::observer::SharedObserver;
use crate::ftp::progress::ProgressSink;
use crate::ftp::transfer::{self, TransferJob, TransferOptions};
use crate::ftp::types::*;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use uuid::Uuid;

pub struct Session {
    id: String,
    config: FtpConnectionConfig,
    control: Option<ControlChannel>,
    data: DataChannelManager,
    observer: SharedObserver,
    info: FtpSessionInfo,
}

impl Session {
    pub fn new(config: FtpConnectionConfig, observer: SharedObserver) -> Self {
        let id = Uuid::new_v4().to_string();
        let info = FtpSessionInfo {
            id: id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            state: SessionState::Disconnected,
            server_banner: None,
            connected_at: None,
            last_activity: None,
            label: config.label.clone(),
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        };
        Self {
            id,
            data: DataChannelManager::new(Duration::from_secs(config.data_timeout_sec)),
            config,
            control: None,
            observer,
            info,
        }
    }

    /// Dial and log in with the configured credentials.
    pub async fn connect(config: FtpConnectionConfig, observer: SharedObserver) -> FtpResult<Self> {
        let mut session = Self::new(config, observer);
        session.dial().await?;
        let (user, pass) = (session.config.username.clone(), session.config.password.clone());
        if let Err(e) = session.login(&user, &pass).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Open the control connection and read the greeting.
    pub async fn dial(&mut self) -> FtpResult<FtpResponse> {
        if self.state() != SessionState::Disconnected {
            return Err(FtpError::invalid_state("Session is already connected"));
        }
        self.config.validate()?;

        let (control, greeting) = ControlChannel::dial(
            &self.config.address(),
            Duration::from_secs(self.config.connect_timeout_sec),
            Duration::from_secs(self.config.command_timeout_sec),
            &self.id,
            self.observer.clone(),
        )
        .await?;

        self.control = Some(control);
        self.info.state = SessionState::Connected;
        self.info.server_banner = Some(greeting.text());
        self.info.connected_at = Some(Utc::now());
        self.touch();
        log::info!("[ftp:{}] connected to {}", self.id, self.config.address());
        Ok(greeting)
    }

    /// `USER` / `PASS`. Moves the session to `Authenticated` on 230.
    pub async fn login(&mut self, username: &str, password: &str) -> FtpResult<()> {
        match self.state() {
            SessionState::Disconnected => return Err(FtpError::not_connected()),
            SessionState::Authenticated => {
                return Err(FtpError::invalid_state("Session is already logged in"))
            }
            SessionState::Connected => {}
        }
        let control = self.control.as_mut().ok_or_else(FtpError::not_connected)?;
        let result = control.login(username, password).await;
        let result = self.track(result);
        if result.is_ok() {
            self.info.state = SessionState::Authenticated;
            self.info.username = username.to_string();
            log::info!("[ftp:{}] logged in as {}", self.id, username);
        }
        result
    }

    /// Best-effort `QUIT`, then drop both sockets. Never fails, also when
    /// the server is already gone.
    pub async fn close(&mut self) {
        if self.data.close() {
            log::debug!("[ftp:{}] dropped open data channel on close", self.id);
        }
        if let Some(control) = self.control.take() {
            control.close().await;
            log::info!("[ftp:{}] disconnected", self.id);
        }
        self.info.state = SessionState::Disconnected;
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.info.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.info.state == SessionState::Authenticated
    }

    pub fn info(&self) -> &FtpSessionInfo {
        &self.info
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    // ─── Simple commands ─────────────────────────────────────────

    pub async fn noop(&mut self) -> FtpResult<()> {
        let control = self.control.as_mut().ok_or_else(FtpError::not_connected)?;
        let result = control.expect("NOOP", &[200]).await.map(|_| ());
        self.track(result)
    }

    pub async fn set_transfer_type(&mut self, tt: TransferType) -> FtpResult<()> {
        let (control, _) = self.channels()?;
        let result = control.expect(tt.command(), &[200]).await.map(|_| ());
        self.track(result)
    }

    /// Create a remote directory. Returns the path the server reports in
    /// its 257 reply, or `name` if the reply carries none.
    pub async fn make_directory(&mut self, name: &str) -> FtpResult<String> {
        let (control, _) = self.channels()?;
        let result = control.expect(&format!("MKD {}", name), &[257]).await;
        let resp = self.track(result)?;
        Ok(quoted_path(&resp.text()).unwrap_or_else(|| name.to_string()))
    }

    /// `RMD` for a directory, `DELE` for a file; both require 250.
    pub async fn delete(&mut self, target: &str, is_directory: bool) -> FtpResult<()> {
        let (control, _) = self.channels()?;
        let verb = if is_directory { "RMD" } else { "DELE" };
        let result = control.expect(&format!("{} {}", verb, target), &[250]).await.map(|_| ());
        self.track(result)
    }

    /// Remote file size via `SIZE` (213).
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let (control, _) = self.channels()?;
        let result = control.expect(&format!("SIZE {}", path), &[213]).await;
        let resp = self.track(result)?;
        transfer::parse_size_reply(&resp)
            .ok_or_else(|| FtpError::protocol_error(format!("Unreadable SIZE reply: {}", resp.text())))
    }

    // ─── Data-channel operations ─────────────────────────────────

    /// `LIST path`: raw listing lines, in server order.
    pub async fn list(&mut self, path: &str) -> FtpResult<Vec<String>> {
        let (control, data) = self.channels()?;
        let cmd = if path.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {}", path)
        };
        let result = Self::list_inner(control, data, &cmd).await;
        let raw = self.track(result)?;
        Ok(listing_lines(&raw))
    }

    async fn list_inner(
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
        cmd: &str,
    ) -> FtpResult<Vec<u8>> {
        data.establish(control).await?;
        let body = match data.start(control, cmd).await {
            Ok(_) => data.read_all().await,
            Err(e) => Err(e),
        };
        data.finish(control, body).await
    }

    /// Upload `local_path` to `remote_path` in binary mode. Returns the
    /// bytes sent.
    pub async fn store(&mut self, local_path: &Path, remote_path: &str) -> FtpResult<u64> {
        let mut file = File::open(local_path)
            .await
            .map_err(|e| FtpError::file_error(format!("Opening {}: {}", local_path.display(), e)))?;
        let chunk = self.config.chunk_size;
        let (control, data) = self.channels()?;

        let result = match control.expect(TransferType::Binary.command(), &[200]).await {
            Ok(_) => {
                let sent = Self::store_inner(control, data, &mut file, remote_path, chunk).await;
                control.restore_ascii().await;
                sent
            }
            Err(e) => Err(e),
        };
        let sent = self.track(result)?;
        self.info.bytes_uploaded += sent;
        log::info!("[ftp:{}] stored {} ({} bytes)", self.id, remote_path, sent);
        Ok(sent)
    }

    async fn store_inner(
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
        file: &mut File,
        remote_path: &str,
        chunk: usize,
    ) -> FtpResult<u64> {
        data.establish(control).await?;
        let body = match data.start(control, &format!("STOR {}", remote_path)).await {
            Ok(_) => data.send_all(file, chunk).await,
            Err(e) => Err(e),
        };
        data.finish(control, body).await
    }

    /// Plain `RETR` into a freshly truncated local file.
    pub async fn retrieve(&mut self, remote_path: &str, local_path: &Path) -> FtpResult<u64> {
        let mut job = TransferJob::new(remote_path, local_path, 0);
        self.download(&mut job, &mut CancelSignal::never(), &ProgressSink::none())
            .await
    }

    /// Run a resumable download job to a terminal state. Returns the bytes
    /// received in this run.
    pub async fn download(
        &mut self,
        job: &mut TransferJob,
        cancel: &mut CancelSignal,
        progress: &ProgressSink,
    ) -> FtpResult<u64> {
        let opts = TransferOptions::from_config(&self.config);
        let before = job.downloaded();
        let (control, data) = self.channels()?;
        let result = job.run(control, data, cancel, progress, &opts).await;
        self.info.bytes_downloaded += job.downloaded().saturating_sub(before);
        let received = self.track(result)?;
        log::info!(
            "[ftp:{}] retrieved {} ({} bytes, {} total)",
            self.id,
            job.remote_path(),
            received,
            job.downloaded()
        );
        Ok(received)
    }

    // ─── Internals ───────────────────────────────────────────────

    /// Both channels, for an authenticated session only.
    fn channels(&mut self) -> FtpResult<(&mut ControlChannel, &mut DataChannelManager)> {
        match self.info.state {
            SessionState::Authenticated => {}
            SessionState::Connected => return Err(FtpError::invalid_state("Not logged in")),
            SessionState::Disconnected => return Err(FtpError::not_connected()),
        }
        let control = self.control.as_mut().ok_or_else(FtpError::not_connected)?;
        Ok((control, &mut self.data))
    }

    /// Record activity; tear the session down if the control channel did
    /// not survive the operation.
    fn track<T>(&mut self, result: FtpResult<T>) -> FtpResult<T> {
        self.touch();
        if self.control.as_ref().map_or(false, ControlChannel::is_broken) {
            log::warn!("[ftp:{}] control channel lost; session disconnected", self.id);
            self.data.close();
            self.control = None;
            self.info.state = SessionState::Disconnected;
        }
        result
    }

    fn touch(&mut self) {
        self.info.last_activity = Some(Utc::now());
    }
}

/// Split a LIST payload into its lines, in order, blank ones included.
fn listing_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw).lines().map(str::to_string).collect()
}

/// Extract `/new/dir` from `257 "/new/dir" created` (`""` is an escaped quote).
fn quoted_path(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let mut out = String::new();
    let mut chars = text[start..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}
