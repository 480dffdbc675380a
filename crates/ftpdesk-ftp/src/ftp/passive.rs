//! PASV reply decoding.
//!
//! Reply format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`, where the
//! data port is `p1 * 256 + p2`. Every field must be a decimal octet; a
//! non-numeric or out-of-range field fails the decode.

use crate::ftp::error::{FtpError, FtpResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Dialable address for exactly one data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PassiveAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }

    /// Substitute `peer` when the server advertised `0.0.0.0`.
    pub fn or_peer(self, peer: Option<IpAddr>) -> SocketAddr {
        match peer {
            Some(ip) if self.ip.is_unspecified() => SocketAddr::new(ip, self.port),
            _ => self.socket_addr(),
        }
    }
}

impl fmt::Display for PassiveAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode the payload of a PASV reply.
pub fn parse_pasv_response(text: &str) -> FtpResult<PassiveAddress> {
    let malformed = || FtpError::protocol_error(format!("malformed PASV: {}", text));

    let start = text.find('(').ok_or_else(malformed)?;
    let end = text.find(')').ok_or_else(malformed)?;
    if end < start {
        return Err(malformed());
    }

    let fields: Vec<&str> = text[start + 1..end].split(',').collect();
    if fields.len() != 6 {
        return Err(malformed());
    }

    let mut nums = [0u8; 6];
    for (slot, field) in nums.iter_mut().zip(&fields) {
        *slot = field.trim().parse::<u8>().map_err(|_| {
            FtpError::protocol_error(format!("malformed PASV field '{}': {}", field, text))
        })?;
    }

    Ok(PassiveAddress {
        ip: Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]),
        port: (nums[4] as u16) * 256 + (nums[5] as u16),
    })
}
