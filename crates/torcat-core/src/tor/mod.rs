//! Tor integration for torcat.
//!
//! Talks to a local Tor daemon through its ControlPort to authenticate,
//! publish ephemeral onion services and discover the SOCKS listener used
//! for outbound connections.
//!
//! ## Design
//!
//! [`TorSession`] owns the control connection and implements
//! [`SessionProvider`](crate::session::SessionProvider). Onion services are
//! created without `Flags=Detach`, so Tor withdraws them as soon as the
//! control connection closes.

mod connection;
mod control_addr;
mod controller;
mod service;
mod session;

pub use connection::{socks_reply_reason, TorConnection, TorConnectionConfig};
pub use control_addr::ControlAddr;
pub use controller::{ProtocolInfo, TorAuth, TorController};
pub use service::OnionService;
pub use session::TorSession;

/// Default SOCKS5 proxy port for Tor.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port for Tor.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Connection timeout for Tor circuits (seconds).
pub const CIRCUIT_TIMEOUT_SECS: u64 = 120;

/// Environment variable carrying the control port credential.
pub const CREDENTIAL_ENV: &str = "TORCAT_COOKIE";
