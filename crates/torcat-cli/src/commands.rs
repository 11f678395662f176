//! CLI command implementation.

use anyhow::{Context, Result};
use torcat_core::{
    run_mode,
    tor::{ControlAddr, TorSession},
    Mode, SessionProvider,
};

/// Parsed command-line inputs.
pub struct Options<'a> {
    pub control: &'a str,
    pub listen: u32,
    pub destination: &'a [String],
    pub credential: Option<&'a str>,
}

/// Validate arguments, open the Tor session and run the conversation.
pub async fn run(opts: Options<'_>) -> Result<()> {
    // Configuration errors surface before any network activity.
    let mode = Mode::from_args(opts.listen, opts.destination)?;
    let control_addr =
        ControlAddr::parse(opts.control).context("Failed to parse control socket")?;

    let mut session = TorSession::open(&control_addr).await?;
    session.authenticate(opts.credential).await?;

    tracing::debug!(mode = %mode, control = %control_addr, "Starting conversation");

    run_mode(
        &mut session,
        &mode,
        tokio::io::stdin(),
        tokio::io::stdout(),
        announce_onion,
    )
    .await?;

    Ok(())
}

/// Tell the user where to connect before we block on accept.
fn announce_onion(address: &str) {
    eprintln!("{}", address);
}
