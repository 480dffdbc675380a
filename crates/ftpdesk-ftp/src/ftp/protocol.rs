//! Reply reader for the control channel (RFC 959 §4.2).
//!
//! Handles:
//! - Reading one reply unit per call, trimmed of its CRLF
//! - Parsing the 3-digit reply code
//! - Multi-line replies (`NNN-` ... `NNN `)

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest reply line accepted, CRLF included.
pub const MAX_LINE_LEN: u64 = 8192;

/// Reads FTP replies off any buffered async reader.
pub struct ResponseReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> ResponseReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read a single physical line with the trailing CRLF removed.
    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = Vec::new();
        let n = AsyncReadExt::take(&mut self.inner, MAX_LINE_LEN)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        if n as u64 == MAX_LINE_LEN && buf.last() != Some(&b'\n') {
            return Err(FtpError::protocol_error(format!(
                "Reply line exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
    }

    /// Read a complete FTP response.
    ///
    /// Multi-line responses look like:
    /// ```text
    /// 220-Welcome to my FTP server
    /// 220-This is line 2
    /// 220 End of greeting
    /// ```
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let code = parse_code(&first)?;
        let is_multi = first.as_bytes().get(3) == Some(&b'-');
        let mut lines = vec![first];

        if is_multi {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        Ok(FtpResponse { code, lines })
    }
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))?;
    match line.as_bytes().get(3) {
        None | Some(b' ') | Some(b'-') => {}
        Some(_) => {
            return Err(FtpError::protocol_error(format!(
                "Malformed reply line: '{}'",
                line
            )))
        }
    }
    digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}
