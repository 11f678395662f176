//! Control endpoint descriptors.
//!
//! Accepted forms:
//!
//! - `9051` - TCP port on 127.0.0.1
//! - `host:port`, `[::1]:port`, `tcp://host:port` - TCP
//! - `unix:/run/tor/control`, `unix:///run/tor/control` - Unix domain socket

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Where Tor's ControlPort lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddr {
    /// TCP control port.
    Tcp {
        /// Hostname or IP literal, without brackets.
        host: String,
        /// Port number, never zero.
        port: u16,
    },
    /// Unix domain control socket.
    Unix(PathBuf),
}

impl ControlAddr {
    /// Parse a control endpoint descriptor.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty control endpoint".into()));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            // unix:///path is the URL spelling of unix:/path
            let path = match path.strip_prefix("//") {
                Some(rest) if rest.starts_with('/') => rest,
                _ => path,
            };
            if path.is_empty() {
                return Err(Error::Config("unix control endpoint needs a path".into()));
            }
            return Ok(ControlAddr::Unix(PathBuf::from(path)));
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(ControlAddr::Tcp {
                host: "127.0.0.1".into(),
                port: parse_port(s)?,
            });
        }

        let s = s.strip_prefix("tcp://").unwrap_or(s);

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("control endpoint {:?} has no port", s)))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| Error::Config(format!("unbalanced brackets in {:?}", s)))?,
            None if host.contains(':') => {
                return Err(Error::Config(format!(
                    "IPv6 control endpoint {:?} must use [addr]:port",
                    s
                )))
            }
            None => host,
        };

        if host.is_empty() {
            return Err(Error::Config(format!("control endpoint {:?} has no host", s)));
        }

        Ok(ControlAddr::Tcp {
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let port: u16 = s
        .parse()
        .map_err(|e| Error::Config(format!("invalid control port {:?}: {}", s, e)))?;
    if port == 0 {
        return Err(Error::Config("control port must be non-zero".into()));
    }
    Ok(port)
}

impl FromStr for ControlAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Default for ControlAddr {
    fn default() -> Self {
        ControlAddr::Tcp {
            host: "127.0.0.1".into(),
            port: super::DEFAULT_CONTROL_PORT,
        }
    }
}

impl fmt::Display for ControlAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddr::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            ControlAddr::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ControlAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}
