//! Tor connection handling.
//!
//! Dials arbitrary `host:port` destinations through Tor's SOCKS5 proxy.
//! Hostnames are always sent to Tor unresolved so DNS never leaks.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Configuration for Tor connections.
#[derive(Debug, Clone)]
pub struct TorConnectionConfig {
    /// SOCKS5 proxy address.
    pub socks_addr: SocketAddr,
    /// Bound on proxy connect plus circuit construction.
    pub timeout: Duration,
}

impl Default for TorConnectionConfig {
    fn default() -> Self {
        Self {
            socks_addr: SocketAddr::from(([127, 0, 0, 1], super::DEFAULT_SOCKS_PORT)),
            timeout: Duration::from_secs(super::CIRCUIT_TIMEOUT_SECS),
        }
    }
}

/// A connection through Tor to a remote destination.
#[derive(Debug)]
pub struct TorConnection {
    stream: TcpStream,
}

impl TorConnection {
    /// Connect to `host:port` through Tor.
    ///
    /// Every failure is reported as [`Error::Dial`] naming the destination.
    pub async fn connect(config: &TorConnectionConfig, host: &str, port: u16) -> Result<Self> {
        let destination = format_destination(host, port);

        let dial = async {
            let stream = TcpStream::connect(config.socks_addr)
                .await
                .map_err(|e| format!("failed to connect to SOCKS proxy {}: {}", config.socks_addr, e))?;

            let mut connection = Self { stream };
            connection.socks5_handshake(host, port).await?;
            Ok::<_, String>(connection)
        };

        match tokio::time::timeout(config.timeout, dial).await {
            Ok(Ok(connection)) => {
                tracing::debug!(destination = %destination, "SOCKS5 CONNECT succeeded");
                Ok(connection)
            }
            Ok(Err(reason)) => Err(Error::Dial { destination, reason }),
            Err(_) => Err(Error::Dial {
                destination,
                reason: format!("timed out after {:?}", config.timeout),
            }),
        }
    }

    /// Perform SOCKS5 handshake.
    async fn socks5_handshake(&mut self, host: &str, port: u16) -> std::result::Result<(), String> {
        // Version 5, 1 auth method (no auth = 0x00)
        self.stream
            .write_all(&[0x05, 0x01, 0x00])
            .await
            .map_err(|e| format!("SOCKS5 greeting failed: {}", e))?;

        let mut response = [0u8; 2];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| format!("SOCKS5 response failed: {}", e))?;

        if response[0] != 0x05 || response[1] != 0x00 {
            return Err("SOCKS5 authentication failed".into());
        }

        let hostname_bytes = host.as_bytes();
        if hostname_bytes.is_empty() || hostname_bytes.len() > 255 {
            return Err("hostname must be 1-255 bytes".into());
        }

        // Version 5, CMD connect (0x01), RSV (0x00), ATYP domain (0x03)
        let mut request = Vec::with_capacity(7 + hostname_bytes.len());
        request.push(0x05);
        request.push(0x01);
        request.push(0x00);
        request.push(0x03);
        request.push(hostname_bytes.len() as u8);
        request.extend_from_slice(hostname_bytes);
        request.extend_from_slice(&port.to_be_bytes());

        self.stream
            .write_all(&request)
            .await
            .map_err(|e| format!("SOCKS5 connect failed: {}", e))?;

        let mut response = [0u8; 4];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| format!("SOCKS5 connect response failed: {}", e))?;

        if response[0] != 0x05 {
            return Err("invalid SOCKS5 version in response".into());
        }

        if response[1] != 0x00 {
            return Err(socks_reply_reason(response[1]));
        }

        // Bound address is ignored but must be consumed.
        let remaining = match response[3] {
            // IPv4: 4 bytes + 2 port
            0x01 => 6,
            0x03 => {
                let mut len = [0u8; 1];
                self.stream
                    .read_exact(&mut len)
                    .await
                    .map_err(|e| e.to_string())?;
                len[0] as usize + 2
            }
            // IPv6: 16 bytes + 2 port
            0x04 => 18,
            _ => return Err("invalid SOCKS5 address type".into()),
        };

        let mut buf = vec![0u8; remaining];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Take the underlying stream for relaying.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Human readable reason for a SOCKS5 reply code, including Tor's
/// extended onion service codes.
pub fn socks_reply_reason(code: u8) -> String {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired (circuit failed)",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        0xF0 => "onion service descriptor not found",
        0xF1 => "onion service descriptor is invalid",
        0xF2 => "onion service introduction failed",
        0xF3 => "onion service rendezvous failed",
        0xF4 => "onion service client authorization missing",
        0xF5 => "onion service client authorization wrong",
        0xF6 => "invalid onion service address",
        0xF7 => "onion service introduction timed out",
        _ => return format!("SOCKS5 connect failed: error code {}", code),
    };
    format!("{} (SOCKS5 code {:#04x})", reason, code)
}

pub(crate) fn format_destination(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
