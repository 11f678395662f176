//! torcat - netcat over Tor
//!
//! Dials `host port` through Tor, or with `-l PORT` publishes a throwaway
//! onion service and waits for one peer. Either way the connection is bridged
//! to stdin/stdout. Status output and logs go to stderr.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

/// torcat - relay stdin/stdout over a Tor circuit or an ephemeral onion service
#[derive(Parser)]
#[command(name = "torcat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Tor control endpoint: port, host:port or unix:/path
    #[arg(long, default_value = "9051")]
    control: String,

    /// Publish an onion service on this port and accept one connection
    /// (0 = dial HOST PORT instead)
    #[arg(short = 'l', long = "listen", default_value_t = 0)]
    listen: u32,

    /// Control port password, used when Tor requires HASHEDPASSWORD
    #[arg(long = "auth", env = "TORCAT_COOKIE", hide_env_values = true)]
    credential: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Destination host and port (dial mode only)
    #[arg(value_name = "HOST PORT")]
    destination: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the conversation, so logs must stay on stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = commands::run(commands::Options {
        control: &cli.control,
        listen: cli.listen,
        destination: &cli.destination,
        credential: cli.credential.as_deref(),
    })
    .await;

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("torcat: {:#}", e);
            1
        }
    };

    // A detached stdin read would otherwise keep the runtime from shutting down.
    std::process::exit(code);
}
