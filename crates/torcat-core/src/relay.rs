//! Bidirectional stream relay.
//!
//! Bridges an established Tor stream to the process's standard input and
//! output. Two copy tasks run concurrently:
//!
//! ```text
//!   stream ──download──▶ stdout
//!   stdin  ───upload───▶ stream
//! ```
//!
//! The conversation ends as soon as either task finishes, cleanly or with an
//! error. The other task is aborted and its result discarded, which drops its
//! half of the stream and closes the connection to the peer.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};

use crate::logging::ErrorChain;

/// Size of the reusable buffer owned by each copy task.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Outcome of a conversation.
pub type RelayResult = std::result::Result<(), RelayError>;

/// Which side of the relay an I/O operation was performed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reading from the Tor stream.
    ReadFromStream,
    /// Writing to standard output.
    WriteToStdout,
    /// Reading from standard input.
    ReadFromStdin,
    /// Writing to the Tor stream.
    WriteToStream,
}

impl Direction {
    /// Stable name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ReadFromStream => "read-from-stream",
            Direction::WriteToStdout => "write-to-stdout",
            Direction::ReadFromStdin => "read-from-stdin",
            Direction::WriteToStream => "write-to-stream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An I/O failure tagged with the direction it happened on.
#[derive(Error, Debug)]
#[error("{direction} failed")]
pub struct RelayError {
    direction: Direction,
    #[source]
    source: io::Error,
}

impl RelayError {
    /// Tag an I/O error with a direction.
    pub fn new(direction: Direction, source: io::Error) -> Self {
        Self { direction, source }
    }

    /// Direction the failure happened on.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
}

/// One of the two copy tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    /// stream -> stdout
    Download,
    /// stdin -> stream
    Upload,
}

impl Leg {
    fn read_direction(self) -> Direction {
        match self {
            Leg::Download => Direction::ReadFromStream,
            Leg::Upload => Direction::ReadFromStdin,
        }
    }

    fn write_direction(self) -> Direction {
        match self {
            Leg::Download => Direction::WriteToStdout,
            Leg::Upload => Direction::WriteToStream,
        }
    }
}

/// What a finished copy task reports.
struct LegReport {
    bytes: u64,
    result: RelayResult,
}

/// Relay bytes between `stream` and the given input/output until one
/// direction finishes.
///
/// `input` is normally stdin and `output` stdout. Returns the outcome of the
/// first copy task to complete. The stream is closed before this returns and
/// neither direction performs further I/O afterwards.
pub async fn relay<S, I, O>(stream: S, input: I, output: O) -> RelayResult
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let (stream_rx, stream_tx) = tokio::io::split(stream);

    let mut download = tokio::spawn(copy_leg(Leg::Download, stream_rx, output));
    let mut upload = tokio::spawn(copy_leg(Leg::Upload, input, stream_tx));

    let (winner, joined) = tokio::select! {
        joined = &mut download => (Leg::Download, joined),
        joined = &mut upload => (Leg::Upload, joined),
    };

    let loser = match winner {
        Leg::Download => upload,
        Leg::Upload => download,
    };
    settle(loser).await;

    let report = match joined {
        Ok(report) => report,
        Err(e) => LegReport {
            bytes: 0,
            result: Err(RelayError::new(winner.read_direction(), join_failure(e))),
        },
    };

    tracing::debug!(
        winner = ?winner,
        bytes = report.bytes,
        ok = report.result.is_ok(),
        "Conversation finished"
    );

    report.result
}

/// Abort the losing task and wait until it has released its stream half.
async fn settle(loser: JoinHandle<LegReport>) {
    loser.abort();
    match loser.await {
        Ok(report) => {
            // Finished in the same instant as the winner.
            if let Err(e) = report.result {
                tracing::debug!(error = %ErrorChain(&e), "Discarding result of second direction");
            }
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::debug!(error = %e, "Second direction task failed"),
    }
}

fn join_failure(e: JoinError) -> io::Error {
    io::Error::other(format!("copy task failed: {}", e))
}

async fn copy_leg<R, W>(leg: Leg, mut reader: R, mut writer: W) -> LegReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let result = copy_until_eof(leg, &mut reader, &mut writer, &mut bytes).await;

    tracing::trace!(leg = ?leg, bytes, "Copy task done");

    LegReport { bytes, result }
}

async fn copy_until_eof<R, W>(leg: Leg, reader: &mut R, writer: &mut W, bytes: &mut u64) -> RelayResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RelayError::new(leg.read_direction(), e)),
        };

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| RelayError::new(leg.write_direction(), e))?;
        writer
            .flush()
            .await
            .map_err(|e| RelayError::new(leg.write_direction(), e))?;

        *bytes += n as u64;
    }

    // Half-close so the peer sees end-of-input.
    if leg == Leg::Upload {
        writer
            .shutdown()
            .await
            .map_err(|e| RelayError::new(leg.write_direction(), e))?;
    }

    Ok(())
}
