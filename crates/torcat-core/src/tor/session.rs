//! Tor-backed session provider.

use super::connection::{format_destination, TorConnection, TorConnectionConfig};
use super::control_addr::ControlAddr;
use super::controller::TorController;
use super::service::OnionService;
use crate::error::{Error, Result};
use crate::logging::Redacted;
use crate::session::SessionProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// An open control connection to the local Tor daemon.
///
/// Constructed once per run and handed to whichever mode needs it.
/// Dropping the session closes the control connection, which also makes Tor
/// withdraw any onion service it published.
pub struct TorSession {
    controller: Arc<Mutex<TorController>>,
    control_addr: ControlAddr,
    dial_timeout: Duration,
}

impl TorSession {
    /// Connect to the control endpoint. Authentication is a separate step.
    pub async fn open(control_addr: &ControlAddr) -> Result<Self> {
        let controller = TorController::connect(control_addr).await?;

        tracing::debug!(control = %control_addr, "Connected to Tor control port");

        Ok(Self::with_controller(controller, control_addr.clone()))
    }

    /// Build a session around an existing controller.
    pub fn with_controller(controller: TorController, control_addr: ControlAddr) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            control_addr,
            dial_timeout: Duration::from_secs(super::CIRCUIT_TIMEOUT_SECS),
        }
    }

    /// Override the bound on SOCKS connect plus circuit construction.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Ask Tor where its SOCKS listener is.
    ///
    /// Falls back to the default port when Tor reports no TCP listener or
    /// does not understand the query.
    pub async fn socks_addr(&self) -> Result<SocketAddr> {
        let mut controller = self.controller.lock().await;
        if !controller.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }

        let fallback = TorConnectionConfig::default().socks_addr;

        match controller.socks_listeners().await {
            Ok(listeners) => match listeners.first() {
                Some(addr) => Ok(*addr),
                None => {
                    tracing::warn!(fallback = %fallback, "Tor reports no TCP SOCKS listener");
                    Ok(fallback)
                }
            },
            Err(Error::Control { code, message }) => {
                tracing::warn!(code, message = %message, fallback = %fallback, "Cannot query SOCKS listeners");
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }
}

impl SessionProvider for TorSession {
    type Stream = TcpStream;
    type Listener = OnionService;

    async fn authenticate(&mut self, credential: Option<&str>) -> Result<()> {
        tracing::debug!(
            control = %self.control_addr,
            credential = ?credential.map(Redacted),
            "Authenticating session"
        );

        let mut controller = self.controller.lock().await;
        controller.authenticate_auto(credential).await?;

        match controller.get_version().await {
            Ok(version) => tracing::info!(version = %version, "Connected to Tor"),
            Err(e) => tracing::warn!("Could not get Tor version: {}", e),
        }

        Ok(())
    }

    async fn dial(&mut self, host: &str, port: u16) -> Result<TcpStream> {
        let socks_addr = self.socks_addr().await.map_err(|e| match e {
            Error::NotAuthenticated => e,
            other => Error::Dial {
                destination: format_destination(host, port),
                reason: format!("cannot locate Tor SOCKS listener: {}", other),
            },
        })?;

        let config = TorConnectionConfig {
            socks_addr,
            timeout: self.dial_timeout,
        };

        tracing::debug!(socks = %config.socks_addr, host = %host, port, "Dialing through Tor");

        let connection = TorConnection::connect(&config, host, port).await?;
        Ok(connection.into_stream())
    }

    async fn publish(&mut self, virtual_port: u16) -> Result<OnionService> {
        if !self.controller.lock().await.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }

        OnionService::start(Arc::clone(&self.controller), virtual_port).await
    }
}
