//! Tor onion service management.
//!
//! Publishes an ephemeral Tor v3 onion service that forwards to a local
//! listener and hands out the first inbound connection.

use super::controller::TorController;
use crate::error::{Error, Result};
use crate::identity::{generate_identity, OnionAddress};
use crate::session::OnionListener;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// A running onion service.
pub struct OnionService {
    /// Address derived from the service key.
    onion_address: OnionAddress,
    /// Service ID returned by Tor (hostname without .onion).
    service_id: String,
    /// Local TCP listener Tor forwards to.
    listener: TcpListener,
    /// Controller connection for cleanup.
    controller: Arc<Mutex<TorController>>,
}

impl OnionService {
    /// Create and start an onion service exposing `virtual_port`.
    ///
    /// Binds a local listener on an ephemeral loopback port first, then
    /// registers the service with Tor via ControlPort.
    pub async fn start(controller: Arc<Mutex<TorController>>, virtual_port: u16) -> Result<Self> {
        if virtual_port == 0 {
            return Err(Error::Config("onion service port must be non-zero".into()));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Listen(format!("failed to bind local listener: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Listen(format!("failed to read listener address: {}", e)))?;

        tracing::info!(local_addr = %local_addr, "Bound local listener");

        let identity = generate_identity()?;

        let service_id = {
            let mut controller = controller.lock().await;
            controller
                .add_onion(&identity, virtual_port, local_addr)
                .await
                .map_err(|e| match e {
                    Error::Control { code, message } => {
                        Error::Listen(format!("ADD_ONION rejected ({}): {}", code, message))
                    }
                    other => other,
                })?
        };

        let onion_address = OnionAddress::from_service_id(&service_id)?;

        tracing::info!(
            onion_address = %onion_address,
            local_addr = %local_addr,
            virtual_port = virtual_port,
            "Onion service registered"
        );

        Ok(Self {
            onion_address,
            service_id,
            listener,
            controller,
        })
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<TcpStream> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Listen(format!("accept failed: {}", e)))?;

        tracing::debug!(?addr, "Accepted incoming connection");

        Ok(stream)
    }

    /// Stop the onion service.
    pub async fn stop(self) -> Result<()> {
        drop(self.listener);

        let mut controller = self.controller.lock().await;
        controller.del_onion(&self.service_id).await?;

        tracing::info!("Onion service stopped");
        Ok(())
    }
}

impl OnionListener for OnionService {
    type Stream = TcpStream;

    fn onion_address(&self) -> &str {
        self.onion_address.as_str()
    }

    async fn accept_one(&mut self) -> Result<TcpStream> {
        self.accept().await
    }

    async fn close(self) -> Result<()> {
        self.stop().await
    }
}
