//! Conversation setup: mode selection and the session provider seam.
//!
//! A [`SessionProvider`] hands out one established stream, either by dialing
//! out through Tor or by publishing an onion service and accepting a single
//! peer. [`run_mode`] drives one conversation from start to finish.

use std::fmt;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::logging::ErrorChain;
use crate::relay;

/// Which side of the conversation this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Dial `host:port` through Tor.
    Connect {
        /// Destination hostname (`.onion` or clearnet).
        host: String,
        /// Destination port.
        port: u16,
    },
    /// Publish an onion service on `port` and accept one connection.
    Listen {
        /// Virtual port exposed on the onion address.
        port: u16,
    },
}

impl Mode {
    /// Build the mode from the raw listen port and positional arguments.
    ///
    /// A non-zero `listen` selects listen mode and `args` is ignored.
    /// Otherwise exactly two arguments, `host port`, are required.
    pub fn from_args(listen: u32, args: &[String]) -> Result<Self> {
        if listen > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "listen port {} is greater than {}",
                listen,
                u16::MAX
            )));
        }
        if listen != 0 {
            return Ok(Mode::Listen { port: listen as u16 });
        }

        let [host, port] = args else {
            return Err(Error::Config(format!(
                "expected `host port`, got {} argument(s)",
                args.len()
            )));
        };

        if host.is_empty() {
            return Err(Error::Config("empty destination address".into()));
        }

        let port: u16 = port
            .parse()
            .map_err(|e| Error::Config(format!("invalid port number {:?}: {}", port, e)))?;
        if port == 0 {
            return Err(Error::Config("destination port must be non-zero".into()));
        }

        Ok(Mode::Connect {
            host: host.clone(),
            port,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Connect { host, port } => write!(f, "connect {}:{}", host, port),
            Mode::Listen { port } => write!(f, "listen on port {}", port),
        }
    }
}

/// An onion service waiting for its single peer.
pub trait OnionListener: Send {
    /// Stream type produced by [`accept_one`](Self::accept_one).
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Full `.onion` address peers should dial.
    fn onion_address(&self) -> &str;

    /// Wait for exactly one inbound connection.
    fn accept_one(&mut self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Withdraw the service and release the local listener.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Capability to obtain a stream through Tor.
pub trait SessionProvider: Send {
    /// Stream type for both dialed and accepted connections.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;
    /// Listener returned by [`publish`](Self::publish).
    type Listener: OnionListener<Stream = Self::Stream>;

    /// Prove authorization to the control endpoint. Must succeed before
    /// [`dial`](Self::dial) or [`publish`](Self::publish).
    fn authenticate(
        &mut self,
        credential: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Open a circuit-routed connection to `host:port`.
    fn dial(&mut self, host: &str, port: u16)
        -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Register a fresh onion service exposing `virtual_port`.
    fn publish(&mut self, virtual_port: u16)
        -> impl Future<Output = Result<Self::Listener>> + Send;
}

/// Run one conversation in `mode`, relaying between the obtained stream and
/// `input`/`output`.
///
/// `announce` receives the onion address in listen mode before the accept
/// starts. The listener is closed on every path once it has been published.
pub async fn run_mode<P, I, O, A>(
    provider: &mut P,
    mode: &Mode,
    input: I,
    output: O,
    announce: A,
) -> Result<()>
where
    P: SessionProvider,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    A: FnOnce(&str),
{
    match mode {
        Mode::Connect { host, port } => {
            let stream = provider.dial(host, *port).await?;
            tracing::info!(host = %host, port = port, "Connected through Tor");
            relay::relay(stream, input, output).await?;
            Ok(())
        }
        Mode::Listen { port } => {
            let mut listener = provider.publish(*port).await?;
            announce(listener.onion_address());

            let result = match listener.accept_one().await {
                Ok(stream) => {
                    tracing::info!("Accepted inbound connection");
                    relay::relay(stream, input, output).await.map_err(Error::from)
                }
                Err(e) => Err(e),
            };

            if let Err(e) = listener.close().await {
                tracing::warn!(error = %ErrorChain(&e), "Failed to withdraw onion service");
            }

            result
        }
    }
}
