//! Resumable, cancellable RETR.
//!
//! A [`TransferJob`] moves `Idle → Active → {Completed | Cancelled | Failed}`
//! exactly once; a finished job cannot be re-run, build a new one (usually
//! via [`TransferJob::resume_from_local`]) to retry.
//!
//! Command order for one run:
//! `TYPE I` → `SIZE` (optional) → `PASV` + dial → `REST n` (n > 0 only) →
//! `RETR` → receive loop → release (226/250) → `TYPE A`.
//!
//! On cancellation the data socket is dropped, the completion reply owed
//! for `RETR` is drained, ascii mode is restored and the local file is
//! flushed and closed. Partial bytes stay on disk as the next resume point.

use crate::ftp::cancel::CancelSignal;
use crate::ftp::control::ControlChannel;
use crate::ftp::data::DataChannelManager;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::progress::{ProgressSink, ProgressThrottle};
use crate::ftp::types::{
    FtpConnectionConfig, FtpResponse, ProgressSnapshot, TransferStatus, TransferType,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::timeout;

lazy_static! {
    /// `150 Opening BINARY mode data connection for f.bin (1048576 bytes)`
    static ref SIZE_HINT: Regex = Regex::new(r"\((\d+) bytes\)").unwrap();
}

/// Knobs for the receive loop, derived from the connection config.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Longest wait for a single data-channel read.
    pub read_timeout: Duration,
    pub progress_interval: Duration,
    pub query_size: bool,
}

impl TransferOptions {
    pub fn from_config(config: &FtpConnectionConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            read_timeout: Duration::from_secs(config.data_timeout_sec),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            query_size: config.query_size,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&FtpConnectionConfig::default())
    }
}

/// Why the receive loop stopped early.
enum Interrupt {
    Cancelled,
    Deadline,
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    id: String,
    remote_path: String,
    local_path: PathBuf,
    offset: u64,
    downloaded: u64,
    total_bytes: Option<u64>,
    deadline: Option<Duration>,
    status: TransferStatus,
}

impl TransferJob {
    /// A job that starts writing at `offset` in `local_path` and asks the
    /// server to start sending at the same byte.
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            offset,
            downloaded: offset,
            total_bytes: None,
            deadline: None,
            status: TransferStatus::Idle,
        }
    }

    /// A job resuming from the current size of `local_path` (0 if missing).
    pub async fn resume_from_local(
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> FtpResult<Self> {
        let local_path = local_path.into();
        let offset = local_resume_offset(&local_path).await?;
        Ok(Self::new(remote_path, local_path, offset))
    }

    /// Fail the receive loop with `Timeout` once `limit` has elapsed.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes of the remote file present locally (resume offset included).
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn file_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.remote_path)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            transfer_id: self.id.clone(),
            file_name: self.file_name().to_string(),
            bytes_downloaded: self.downloaded,
            total_size: self.total_bytes,
        }
    }

    /// Run the job to a terminal state. Returns the number of bytes
    /// received in this run (excluding the resume offset).
    pub(crate) async fn run(
        &mut self,
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
        cancel: &mut CancelSignal,
        progress: &ProgressSink,
        opts: &TransferOptions,
    ) -> FtpResult<u64> {
        if self.status != TransferStatus::Idle {
            return Err(FtpError::invalid_state(format!(
                "Transfer {} already ran ({:?})",
                self.id, self.status
            )));
        }
        self.status = TransferStatus::Active;
        log::debug!(
            "[ftp:{}] RETR {} -> {} from offset {}",
            control.session_id(),
            self.remote_path,
            self.local_path.display(),
            self.offset
        );

        let result = if cancel.is_cancelled() {
            Err(FtpError::cancelled("Download cancelled before it started"))
        } else {
            self.execute(control, data, cancel, progress, opts).await
        };

        self.status = match &result {
            Ok(_) => TransferStatus::Completed,
            Err(e) if e.is_cancelled() => TransferStatus::Cancelled,
            Err(_) => TransferStatus::Failed,
        };
        match &result {
            Ok(n) => log::debug!(
                "[ftp:{}] RETR {} complete: {} new bytes, {} on disk",
                control.session_id(),
                self.remote_path,
                n,
                self.downloaded
            ),
            Err(e) => log::debug!(
                "[ftp:{}] RETR {} ended {:?} at {} bytes: {}",
                control.session_id(),
                self.remote_path,
                self.status,
                self.downloaded,
                e
            ),
        }
        result
    }

    async fn execute(
        &mut self,
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
        cancel: &mut CancelSignal,
        progress: &ProgressSink,
        opts: &TransferOptions,
    ) -> FtpResult<u64> {
        let mut file = self.open_local().await?;
        control.expect(TransferType::Binary.command(), &[200]).await?;

        let result = self
            .transfer_binary(control, data, &mut file, cancel, progress, opts)
            .await;

        control.restore_ascii().await;

        let flushed = file.flush().await;
        drop(file);
        let received = result?;
        flushed.map_err(|e| FtpError::file_error(format!("Flushing {}: {}", self.local_path.display(), e)))?;
        Ok(received)
    }

    async fn transfer_binary(
        &mut self,
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
        file: &mut File,
        cancel: &mut CancelSignal,
        progress: &ProgressSink,
        opts: &TransferOptions,
    ) -> FtpResult<u64> {
        if opts.query_size {
            self.total_bytes = query_remote_size(control, &self.remote_path).await?;
        }

        if let Some(total) = self.total_bytes {
            if self.offset > total {
                return Err(FtpError::file_error(format!(
                    "Local file {} ({} bytes) is larger than remote {} ({} bytes)",
                    self.local_path.display(),
                    self.offset,
                    self.remote_path,
                    total
                )));
            }
            if self.offset == total {
                progress.emit(self.snapshot());
                return Ok(0);
            }
        }

        data.establish(control).await?;
        let result = match self.start_retr(control, data).await {
            Ok(()) => self.pump(data, file, cancel, progress, opts).await,
            Err(e) => Err(e),
        };

        let received = data.finish(control, result).await?;
        progress.emit(self.snapshot());
        Ok(received)
    }

    /// `REST` (when resuming) immediately followed by `RETR`.
    async fn start_retr(
        &mut self,
        control: &mut ControlChannel,
        data: &mut DataChannelManager,
    ) -> FtpResult<()> {
        // REST 0 is a no-op on every server, so fresh downloads skip it.
        if self.offset > 0 {
            control.expect(&format!("REST {}", self.offset), &[350]).await?;
        }
        let resp = data.start(control, &format!("RETR {}", self.remote_path)).await?;
        if self.total_bytes.is_none() && self.offset == 0 {
            self.total_bytes = size_hint(&resp);
        }
        Ok(())
    }

    /// Copy the data stream into `file` until EOF, cancellation, the job
    /// deadline, or an error.
    async fn pump(
        &mut self,
        data: &mut DataChannelManager,
        file: &mut File,
        cancel: &mut CancelSignal,
        progress: &ProgressSink,
        opts: &TransferOptions,
    ) -> FtpResult<u64> {
        let mut buf = vec![0u8; opts.chunk_size.max(1)];
        let mut throttle = ProgressThrottle::new(opts.progress_interval);
        let deadline = self.deadline.map(|d| tokio::time::Instant::now() + d);
        let mut received = 0u64;

        if throttle.should_emit(Instant::now()) {
            progress.emit(self.snapshot());
        }

        loop {
            let stream = data.stream()?;
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = wait_until(deadline) => Err(Interrupt::Deadline),
                r = timeout(opts.read_timeout, stream.read(&mut buf)) => Ok(r),
            };

            let n = match read {
                Err(Interrupt::Cancelled) => {
                    return Err(FtpError::cancelled(format!(
                        "Download of {} cancelled at {} bytes",
                        self.remote_path, self.downloaded
                    )))
                }
                Err(Interrupt::Deadline) => {
                    return Err(FtpError::timeout(format!(
                        "Download of {} exceeded its deadline at {} bytes",
                        self.remote_path, self.downloaded
                    )))
                }
                Ok(Err(_)) => {
                    return Err(FtpError::timeout(format!(
                        "No data within {}s",
                        opts.read_timeout.as_secs_f32()
                    )))
                }
                Ok(Ok(r)) => r?,
            };
            if n == 0 {
                break;
            }

            let n64 = n as u64;
            if let Some(total) = self.total_bytes {
                if self.downloaded + n64 > total {
                    return Err(FtpError::protocol_error(format!(
                        "Server sent more than the advertised {} bytes of {}",
                        total, self.remote_path
                    )));
                }
            }
            file.write_all(&buf[..n]).await?;
            self.downloaded += n64;
            received += n64;

            if throttle.should_emit(Instant::now()) {
                progress.emit(self.snapshot());
            }
        }

        Ok(received)
    }

    /// Open (or create) the local file positioned at the resume offset.
    /// Anything past the offset is cut off; a file shorter than the offset
    /// cannot be resumed.
    async fn open_local(&self) -> FtpResult<File> {
        let path = self.local_path.display();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.local_path)
            .await
            .map_err(|e| FtpError::file_error(format!("Opening {}: {}", path, e)))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| FtpError::file_error(format!("Reading {}: {}", path, e)))?
            .len();

        if len < self.offset {
            return Err(FtpError::file_error(format!(
                "{} has {} bytes, cannot resume at {}",
                path, len, self.offset
            )));
        }
        if len > self.offset {
            file.set_len(self.offset)
                .await
                .map_err(|e| FtpError::file_error(format!("Truncating {}: {}", path, e)))?;
        }
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| FtpError::file_error(format!("Seeking {}: {}", path, e)))?;
        Ok(file)
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Size of an existing local file, or 0 when it does not exist.
pub async fn local_resume_offset(path: &Path) -> FtpResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(FtpError::file_error(format!("{} is not a regular file", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(FtpError::file_error(format!("Inspecting {}: {}", path.display(), e))),
    }
}

/// `SIZE path`; `None` when the server will not say.
pub(crate) async fn query_remote_size(control: &mut ControlChannel, path: &str) -> FtpResult<Option<u64>> {
    let resp = control.send_command(&format!("SIZE {}", path)).await?;
    if resp.code != 213 {
        let err = FtpError::from_reply(resp.code, &resp.text());
        if err.kind != FtpErrorKind::ProtocolError {
            return Err(err);
        }
        log::debug!("[ftp:{}] SIZE {} unavailable: {}", control.session_id(), path, resp.text());
        return Ok(None);
    }
    Ok(parse_size_reply(&resp))
}

/// Byte count of a `213` reply.
pub(crate) fn parse_size_reply(resp: &FtpResponse) -> Option<u64> {
    resp.message().split_whitespace().next()?.parse().ok()
}

/// Byte count advertised in a `150 ... (N bytes)` reply.
pub(crate) fn size_hint(resp: &FtpResponse) -> Option<u64> {
    SIZE_HINT.captures(&resp.text())?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16, line: &str) -> FtpResponse {
        FtpResponse {
            code,
            lines: vec![line.to_string()],
        }
    }

    #[test]
    fn new_job_is_idle_at_offset() {
        let job = TransferJob::new("/pub/a/b.iso", "/tmp/b.iso", 42);
        assert_eq!(job.status(), TransferStatus::Idle);
        assert_eq!(job.offset(), 42);
        assert_eq!(job.downloaded(), 42);
        assert_eq!(job.file_name(), "b.iso");
        assert_eq!(job.snapshot().bytes_downloaded, 42);
        assert_ne!(job.id(), TransferJob::new("x", "y", 0).id());
    }

    #[test]
    fn file_name_ignores_trailing_slash() {
        assert_eq!(TransferJob::new("dir/file.txt/", "x", 0).file_name(), "file.txt");
        assert_eq!(TransferJob::new("plain", "x", 0).file_name(), "plain");
    }

    #[test]
    fn size_hint_pattern_compiles() {
        assert!(SIZE_HINT.is_match("for a.bin (0 bytes)."));
        assert!(!SIZE_HINT.is_match("(many bytes)"));
    }

    #[test]
    fn size_hint_from_preliminary_reply() {
        let r = reply(150, "150 Opening BINARY mode data connection for f.bin (10485760 bytes).");
        assert_eq!(size_hint(&r), Some(10_485_760));
        assert_eq!(size_hint(&reply(150, "150 File status okay")), None);
    }

    #[test]
    fn size_reply_parsing() {
        assert_eq!(parse_size_reply(&reply(213, "213 4096")), Some(4096));
        assert_eq!(parse_size_reply(&reply(213, "213 ")), None);
    }

    #[tokio::test]
    async fn resume_offset_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.bin");
        assert_eq!(local_resume_offset(&path).await.unwrap(), 0);

        tokio::fs::write(&path, vec![7u8; 1234]).await.unwrap();
        let job = TransferJob::resume_from_local("/r/part.bin", &path).await.unwrap();
        assert_eq!(job.offset(), 1234);

        let err = local_resume_offset(dir.path()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::FileError);
    }

    #[tokio::test]
    async fn open_local_truncates_past_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let job = TransferJob::new("f.bin", &path, 4);
        let mut file = job.open_local().await.unwrap();
        file.write_all(b"xy").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"0123xy");
    }

    #[tokio::test]
    async fn open_local_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let err = TransferJob::new("f.bin", &path, 10).open_local().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::FileError);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abc");
    }
}
