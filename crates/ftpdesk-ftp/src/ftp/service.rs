//! High-level orchestrator: owns the one active session and exposes the
//! operations an application shell calls.
//!
//! The session sits behind an async mutex, so operations run one at a time.
//! Cancel handles of downloads live in their own sync mutex, which lets
//! `cancel_download` reach them while `download` holds the session. A
//! download registers its handle before it waits for the session, so a
//! cancel is never lost to that wait.

use crate::ftp::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::observer::{log_observer, SharedObserver};
use crate::ftp::progress::ProgressSink;
use crate::ftp::session::Session;
use crate::ftp::transfer::TransferJob;
use crate::ftp::types::*;
use log::info;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Thread-safe handle shared with the application shell.
pub type FtpServiceState = Arc<FtpService>;

pub struct FtpService {
    defaults: FtpConnectionConfig,
    observer: SharedObserver,
    progress: ProgressSink,
    session: Mutex<Option<Session>>,
    /// Cancel handles of pending and running downloads, by transfer id.
    active_downloads: StdMutex<HashMap<String, CancelHandle>>,
}

impl FtpService {
    /// Service with default timeouts, logging observer and no progress
    /// subscriber.
    pub fn new() -> FtpServiceState {
        Self::with_settings(FtpConnectionConfig::default(), None, log_observer())
    }

    /// `defaults` supplies everything `connect` does not: timeouts, chunk
    /// size, progress interval. Progress snapshots of downloads go to
    /// `progress` and are dropped when the receiver lags.
    pub fn with_settings(
        defaults: FtpConnectionConfig,
        progress: Option<mpsc::Sender<ProgressSnapshot>>,
        observer: SharedObserver,
    ) -> FtpServiceState {
        Arc::new(FtpService {
            defaults,
            observer,
            progress: progress.map(ProgressSink::new).unwrap_or_default(),
            session: Mutex::new(None),
            active_downloads: StdMutex::new(HashMap::new()),
        })
    }

    // ─── Connection lifecycle ────────────────────────────────────

    /// Connect and log in to `host:port`, replacing any current session.
    pub async fn connect(&self, address: &str, username: &str, password: &str) -> FtpResult<FtpSessionInfo> {
        let target = FtpConnectionConfig::from_address(address, username, password)?;
        let config = FtpConnectionConfig {
            host: target.host,
            port: target.port,
            username: target.username,
            password: target.password,
            ..self.defaults.clone()
        };

        let mut slot = self.session.lock().await;
        if let Some(mut previous) = slot.take() {
            info!("FTP replacing session {}", previous.id());
            previous.close().await;
        }

        info!("FTP connecting to {}:{}", config.host, config.port);
        let session = Session::connect(config, self.observer.clone()).await?;
        let info = session.info().clone();
        *slot = Some(session);
        Ok(info)
    }

    /// Cancel any pending or running download, then close the session.
    pub async fn disconnect(&self) -> FtpResult<()> {
        self.cancel_download();
        let mut slot = self.session.lock().await;
        match slot.take() {
            Some(mut session) => {
                session.close().await;
                info!("FTP session {} disconnected", session.id());
                Ok(())
            }
            None => Err(FtpError::not_connected()),
        }
    }

    pub async fn session_info(&self) -> Option<FtpSessionInfo> {
        self.session.lock().await.as_ref().map(|s| s.info().clone())
    }

    // ─── Directory operations ────────────────────────────────────

    pub async fn list(&self, path: &str) -> FtpResult<Vec<String>> {
        let mut slot = self.session.lock().await;
        connected(&mut slot)?.list(path).await
    }

    pub async fn make_directory(&self, path: &str) -> FtpResult<String> {
        let mut slot = self.session.lock().await;
        connected(&mut slot)?.make_directory(path).await
    }

    pub async fn delete(&self, path: &str, is_directory: bool) -> FtpResult<()> {
        let mut slot = self.session.lock().await;
        connected(&mut slot)?.delete(path, is_directory).await
    }

    // ─── Transfers ───────────────────────────────────────────────

    pub async fn upload(&self, local_path: &Path, remote_path: &str) -> FtpResult<u64> {
        let mut slot = self.session.lock().await;
        connected(&mut slot)?.store(local_path, remote_path).await
    }

    /// Download `remote_path`, resuming from the size of an existing
    /// `local_path`. Fails with `Cancelled` if `cancel_download` is called
    /// meanwhile; the partial file is kept for the next attempt.
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> FtpResult<u64> {
        let key = Uuid::new_v4().to_string();
        let (handle, mut signal) = cancel_pair();
        self.active().insert(key.clone(), handle);
        let result = self.run_download(remote_path, local_path, &mut signal).await;
        self.active().remove(&key);
        result
    }

    async fn run_download(
        &self,
        remote_path: &str,
        local_path: &Path,
        signal: &mut CancelSignal,
    ) -> FtpResult<u64> {
        let mut slot = self.session.lock().await;
        if signal.is_cancelled() {
            info!("FTP download {} cancelled while waiting for the session", remote_path);
            return Err(FtpError::cancelled("Download cancelled before it started"));
        }
        let session = connected(&mut slot)?;
        let mut job = TransferJob::resume_from_local(remote_path, local_path).await?;
        if job.offset() > 0 {
            info!("FTP resuming {} at byte {}", remote_path, job.offset());
        }

        let result = session.download(&mut job, signal, &self.progress).await;
        if let Err(e) = &result {
            info!("FTP download {} ended as {:?}: {}", remote_path, job.status(), e);
        }
        result
    }

    /// Signal every pending or running download to stop. Returns whether
    /// there was one.
    pub fn cancel_download(&self) -> bool {
        let active = self.active();
        for handle in active.values() {
            handle.cancel();
        }
        if !active.is_empty() {
            info!("FTP download cancel requested ({} active)", active.len());
        }
        !active.is_empty()
    }

    pub fn is_downloading(&self) -> bool {
        !self.active().is_empty()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CancelHandle>> {
        self.active_downloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn connected(slot: &mut Option<Session>) -> FtpResult<&mut Session> {
    slot.as_mut().ok_or_else(FtpError::not_connected)
}
