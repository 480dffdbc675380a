//! Data-channel management, passive mode only.
//!
//! One PASV negotiation authorises exactly one data connection. Every
//! `establish` must be paired with a `release`, on error paths too:
//! `release` drops the socket and then reads the completion reply the
//! server owes for the transfer command, keeping the control channel in
//! step.

use crate::ftp::control::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::passive::{parse_pasv_response, PassiveAddress};
use crate::ftp::types::FtpResponse;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct DataChannelManager {
    io_timeout: Duration,
    stream: Option<TcpStream>,
}

impl DataChannelManager {
    /// `io_timeout` bounds the data dial and every single read or write.
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            io_timeout,
            stream: None,
        }
    }

    /// Issue `PASV`, decode the reply and dial the advertised address.
    /// Any data connection still open is closed first.
    pub async fn establish(&mut self, control: &mut ControlChannel) -> FtpResult<PassiveAddress> {
        self.close();

        let resp = control.expect("PASV", &[227]).await?;
        let address = parse_pasv_response(&resp.text())?;
        let target = address.or_peer(control.peer_ip());

        let tcp = timeout(self.io_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| FtpError::connection_failed(format!("PASV data connect to {} timed out", target)))?
            .map_err(|e| FtpError::connection_failed(format!("PASV data connect to {}: {}", target, e)))?;
        tcp.set_nodelay(true).ok();

        control.observer().on_data_channel(control.session_id(), &address);
        self.stream = Some(tcp);
        Ok(address)
    }

    /// Send the transfer command (`LIST`, `STOR`, `RETR`) over the control
    /// channel. Only a 1xx reply opens the data phase; a completion reply
    /// is then owed. A 2xx here means the server skipped the data phase.
    pub async fn start(&mut self, control: &mut ControlChannel, cmd: &str) -> FtpResult<FtpResponse> {
        if self.stream.is_none() {
            return Err(FtpError::invalid_state("No data connection established"));
        }
        let resp = control.send_command(cmd).await?;
        if resp.is_preliminary() {
            control.owe_reply();
            Ok(resp)
        } else if resp.is_completion() {
            Err(FtpError::protocol_error(format!(
                "Expected 1xx before data transfer, got: {}",
                resp.text()
            ))
            .with_code(resp.code))
        } else {
            Err(FtpError::from_reply(resp.code, &resp.text()))
        }
    }

    pub fn stream(&mut self) -> FtpResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| FtpError::invalid_state("No data connection established"))
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Read until the server closes the data connection.
    pub async fn read_all(&mut self) -> FtpResult<Vec<u8>> {
        let limit = self.io_timeout;
        let stream = self.stream()?;
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = timeout(limit, stream.read(&mut buf))
                .await
                .map_err(|_| FtpError::timeout(format!("No data within {}s", limit.as_secs_f32())))??;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Copy `src` into the data connection, then shut down our write side
    /// to signal end-of-data. Returns the bytes sent.
    pub async fn send_all<R: AsyncRead + Unpin>(&mut self, src: &mut R, chunk_size: usize) -> FtpResult<u64> {
        let limit = self.io_timeout;
        let stream = self.stream()?;
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            timeout(limit, stream.write_all(&buf[..n]))
                .await
                .map_err(|_| FtpError::timeout(format!("Data write stalled for {}s", limit.as_secs_f32())))??;
            sent += n as u64;
        }
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(sent)
    }

    /// Drop the data socket. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        self.stream.take().is_some()
    }

    /// Close the data connection, then read the completion reply owed for
    /// the transfer command, if one is owed.
    pub async fn release(&mut self, control: &mut ControlChannel) -> FtpResult<Option<FtpResponse>> {
        if self.close() {
            log::debug!("[ftp:{}] data channel closed", control.session_id());
        }
        control.take_owed_reply().await
    }

    /// Release after a transfer body ran and fold the completion reply
    /// into its result: `226`/`250` confirm it, any other code fails it.
    /// An error from the body wins over an error from the release.
    pub async fn finish<T>(&mut self, control: &mut ControlChannel, body: FtpResult<T>) -> FtpResult<T> {
        let released = self.release(control).await;
        let value = match body {
            Ok(v) => v,
            Err(e) => {
                if let Err(drain) = released {
                    log::debug!("[ftp:{}] release after failed transfer: {}", control.session_id(), drain);
                }
                return Err(e);
            }
        };
        match released? {
            Some(reply) if reply.code != 226 && reply.code != 250 => {
                Err(FtpError::from_reply(reply.code, &reply.text()))
            }
            _ => Ok(value),
        }
    }
}
