//! # torcat core library
//!
//! netcat over Tor: carries a single TCP conversation between the process's
//! standard input/output and either an outbound Tor circuit or an ephemeral
//! onion service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          torcat (CLI binary)            │
//! ├─────────────────────────────────────────┤
//! │  session (Mode, run_mode)  │   relay    │
//! ├─────────────────────────────────────────┤
//! │  tor (ControlPort, SOCKS5, onion svc)   │
//! ├─────────────────────────────────────────┤
//! │              identity                   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The relay only needs an `AsyncRead + AsyncWrite` stream; everything
//! Tor-specific sits behind [`session::SessionProvider`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod identity;
pub mod logging;
pub mod relay;
pub mod session;
pub mod tor;

pub use error::{Error, Result};
pub use relay::{relay, Direction, RelayError, RelayResult};
pub use session::{run_mode, Mode, OnionListener, SessionProvider};
