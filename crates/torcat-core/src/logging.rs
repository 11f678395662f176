//! Logging helpers.
//!
//! Control port secrets (passwords, cookies, SAFECOOKIE nonces and hashes)
//! only ever reach `tracing` wrapped in one of the redacting types.
//! [`ErrorChain`] renders an error together with its causes.

use std::error::Error as StdError;
use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a hex string, showing only first and last 4 characters.
pub struct RedactedHex<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 && s.is_ascii() {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED HEX]")
        }
    }
}

impl<'a> fmt::Debug for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a control command line, keeping only the keyword.
///
/// `AUTHENTICATE <secret>` becomes `AUTHENTICATE [REDACTED]`, `ADD_ONION`
/// key blobs are hidden the same way.
pub struct RedactedCommand<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedCommand<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_once(' ') {
            Some((keyword, _)) if is_secret_command(keyword) => write!(f, "{} [REDACTED]", keyword),
            _ => f.write_str(self.0),
        }
    }
}

impl<'a> fmt::Debug for RedactedCommand<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Display an error followed by every `source()` in its chain,
/// separated by `: `.
pub struct ErrorChain<'a>(pub &'a (dyn StdError + 'static));

impl<'a> fmt::Display for ErrorChain<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self.0.source();
        while let Some(err) = cause {
            write!(f, ": {}", err)?;
            cause = err.source();
        }
        Ok(())
    }
}

impl<'a> fmt::Debug for ErrorChain<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn is_secret_command(keyword: &str) -> bool {
    matches!(keyword, "AUTHENTICATE" | "AUTHCHALLENGE" | "ADD_ONION")
}
