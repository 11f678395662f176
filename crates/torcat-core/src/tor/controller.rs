//! Tor ControlPort client implementation.
//!
//! Speaks the line-based ControlPort protocol (Tor control-spec.txt).
//! Supports NULL, cookie, SAFECOOKIE and password authentication, and the
//! ADD_ONION/DEL_ONION/GETINFO commands torcat needs.

use super::control_addr::ControlAddr;
use crate::error::{Error, Result};
use crate::identity::{OnionAddress, OnionIdentity};
use crate::logging::{RedactedCommand, RedactedHex};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::iter::Peekable;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::Chars;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// HMAC key for the hash Tor sends in its AUTHCHALLENGE reply.
const SAFECOOKIE_SERVER_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";

/// HMAC key for the hash we send in AUTHENTICATE.
const SAFECOOKIE_CLIENT_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Control auth cookies are always 32 bytes.
const COOKIE_LEN: usize = 32;

/// Length of the SAFECOOKIE client nonce.
const NONCE_LEN: usize = 32;

/// Cookie locations tried when PROTOCOLINFO's path is unreadable.
const COOKIE_LOCATIONS: &[&str] = &[
    "/run/tor/control.authcookie",
    "/var/run/tor/control.authcookie",
    "/var/lib/tor/control_auth_cookie",
];

/// Authentication method for Tor ControlPort.
#[derive(Clone)]
pub enum TorAuth {
    /// No authentication required.
    None,
    /// Plain cookie authentication (sends the file contents).
    Cookie(PathBuf),
    /// SAFECOOKIE challenge/response using the cookie file.
    SafeCookie(PathBuf),
    /// Password authentication.
    Password(String),
}

impl fmt::Debug for TorAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorAuth::None => write!(f, "None"),
            TorAuth::Cookie(path) => write!(f, "Cookie({})", path.display()),
            TorAuth::SafeCookie(path) => write!(f, "SafeCookie({})", path.display()),
            TorAuth::Password(_) => write!(f, "Password([REDACTED])"),
        }
    }
}

/// A complete control port reply.
#[derive(Debug)]
struct Reply {
    /// Status code of the final line.
    code: u16,
    /// Text of every line, data blocks joined with `\n`.
    lines: Vec<String>,
}

/// Tor ControlPort client.
pub struct TorController {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    authenticated: bool,
}

impl TorController {
    /// Connect to Tor ControlPort.
    pub async fn connect(addr: &ControlAddr) -> Result<Self> {
        match addr {
            ControlAddr::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::Tor(format!("failed to connect to control port {}: {}", addr, e)))?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(unix)]
            ControlAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::Tor(format!("failed to connect to control socket {}: {}", addr, e)))?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(not(unix))]
            ControlAddr::Unix(_) => Err(Error::Config(
                "unix control sockets are not supported on this platform".into(),
            )),
        }
    }

    /// Wrap an already connected control stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: BufReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            authenticated: false,
        }
    }

    /// Whether AUTHENTICATE has succeeded on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Send a command and read the response.
    ///
    /// Returns the text of every reply line with status codes stripped.
    /// Any non-2xx final status becomes [`Error::Control`].
    pub async fn command(&mut self, cmd: &str) -> Result<Vec<String>> {
        tracing::trace!(command = %RedactedCommand(cmd), "Sending control command");

        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| Error::Tor(format!("failed to send command: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Tor(format!("failed to flush: {}", e)))?;

        let reply = self.read_reply().await?;

        if !(200..300).contains(&reply.code) {
            return Err(Error::Control {
                code: reply.code,
                message: reply.lines.join(" "),
            });
        }

        Ok(reply.lines)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Tor(format!("failed to read response: {}", e)))?;

        if n == 0 {
            return Err(Error::Tor("control connection closed".into()));
        }

        Ok(line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }

            // "250-..." mid reply, "250+..." data follows, "250 ..." final
            let (code, separator, body) = split_status_line(&line)?;

            match separator {
                '-' => lines.push(body.to_string()),
                '+' => {
                    let mut data = body.to_string();
                    loop {
                        let data_line = self.read_line().await?;
                        if data_line == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(data_line.strip_prefix('.').unwrap_or(&data_line));
                    }
                    lines.push(data);
                }
                _ => {
                    lines.push(body.to_string());
                    return Ok(Reply { code, lines });
                }
            }
        }
    }

    /// Get protocol info to determine authentication method.
    pub async fn get_protocol_info(&mut self) -> Result<ProtocolInfo> {
        let lines = self.command("PROTOCOLINFO 1").await?;

        let mut info = ProtocolInfo::default();

        for line in &lines {
            // AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/path"
            if let Some(auth_part) = line.strip_prefix("AUTH ") {
                for (key, value) in parse_kv(auth_part) {
                    match key.as_str() {
                        "METHODS" => {
                            info.auth_methods = value.split(',').map(String::from).collect();
                        }
                        "COOKIEFILE" => info.cookie_file = Some(PathBuf::from(value)),
                        _ => {}
                    }
                }
            } else if let Some(version_part) = line.strip_prefix("VERSION ") {
                info.version = parse_kv(version_part)
                    .into_iter()
                    .find(|(key, _)| key == "Tor")
                    .map(|(_, value)| value);
            }
        }

        Ok(info)
    }

    /// Authenticate with the control port.
    pub async fn authenticate(&mut self, auth: TorAuth) -> Result<()> {
        tracing::debug!(method = ?auth, "Authenticating with control port");

        let cmd = Zeroizing::new(match auth {
            TorAuth::None => "AUTHENTICATE".to_string(),
            TorAuth::Cookie(path) => {
                let cookie = read_cookie(&path)?;
                format!("AUTHENTICATE {}", hex::encode(cookie.as_slice()))
            }
            TorAuth::SafeCookie(path) => {
                let cookie = read_cookie(&path)?;
                let client_hash = self.safecookie_challenge(&cookie).await?;
                format!("AUTHENTICATE {}", hex::encode(client_hash.as_slice()))
            }
            TorAuth::Password(password) => {
                if password.contains(|c: char| c == '\r' || c == '\n') {
                    return Err(Error::Auth("password contains a line break".into()));
                }
                format!("AUTHENTICATE \"{}\"", escape_tor_string(&password))
            }
        });

        self.command(&cmd).await.map_err(|e| match e {
            Error::Control { code, message } => Error::Auth(format!("{} ({})", message, code)),
            other => other,
        })?;
        self.authenticated = true;

        tracing::info!("Authenticated with Tor control port");
        Ok(())
    }

    /// Run the SAFECOOKIE challenge and return the hash to authenticate with.
    ///
    /// Fails if Tor's server hash does not prove knowledge of the cookie.
    async fn safecookie_challenge(&mut self, cookie: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let mut client_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut client_nonce);

        let lines = self
            .command(&format!("AUTHCHALLENGE SAFECOOKIE {}", hex::encode(client_nonce)))
            .await
            .map_err(|e| match e {
                Error::Control { code, message } => Error::Auth(format!("{} ({})", message, code)),
                other => other,
            })?;

        let challenge = lines
            .iter()
            .find_map(|line| line.strip_prefix("AUTHCHALLENGE "))
            .ok_or_else(|| Error::Auth("missing AUTHCHALLENGE reply".into()))?;

        let mut server_hash = None;
        let mut server_nonce = None;
        for (key, value) in parse_kv(challenge) {
            match key.as_str() {
                "SERVERHASH" => server_hash = Some(value),
                "SERVERNONCE" => server_nonce = Some(value),
                _ => {}
            }
        }

        let server_hash = server_hash.ok_or_else(|| Error::Auth("AUTHCHALLENGE without SERVERHASH".into()))?;
        let server_nonce = server_nonce.ok_or_else(|| Error::Auth("AUTHCHALLENGE without SERVERNONCE".into()))?;

        tracing::trace!(
            server_hash = %RedactedHex(&server_hash),
            server_nonce = %RedactedHex(&server_nonce),
            "Received SAFECOOKIE challenge"
        );

        let server_hash =
            hex::decode(&server_hash).map_err(|e| Error::Auth(format!("malformed SERVERHASH: {}", e)))?;
        let server_nonce =
            hex::decode(&server_nonce).map_err(|e| Error::Auth(format!("malformed SERVERNONCE: {}", e)))?;

        let expected = safecookie_hash(SAFECOOKIE_SERVER_KEY, cookie, &client_nonce, &server_nonce)?;
        if expected.as_slice() != server_hash.as_slice() {
            return Err(Error::Auth(
                "SAFECOOKIE server hash mismatch; control port does not know our cookie".into(),
            ));
        }

        safecookie_hash(SAFECOOKIE_CLIENT_KEY, cookie, &client_nonce, &server_nonce)
    }

    /// Auto-authenticate using available methods.
    ///
    /// `credential` is an optional password, used when Tor offers
    /// HASHEDPASSWORD. Cookie methods read the cookie file Tor reports.
    pub async fn authenticate_auto(&mut self, credential: Option<&str>) -> Result<()> {
        let info = self.get_protocol_info().await?;

        tracing::debug!(
            methods = ?info.auth_methods,
            cookie_file = ?info.cookie_file,
            "Tor auth methods"
        );

        if info.supports("NULL") {
            return self.authenticate(TorAuth::None).await;
        }

        if let Some(password) = credential {
            if info.supports("HASHEDPASSWORD") {
                return self.authenticate(TorAuth::Password(password.to_string())).await;
            }
        }

        let safecookie = info.supports("SAFECOOKIE");
        if safecookie || info.supports("COOKIE") {
            let path = find_cookie_file(info.cookie_file.as_deref())?;
            let auth = if safecookie {
                TorAuth::SafeCookie(path)
            } else {
                TorAuth::Cookie(path)
            };
            return self.authenticate(auth).await;
        }

        if info.supports("HASHEDPASSWORD") {
            return Err(Error::Auth(format!(
                "control port requires a password; set {}",
                super::CREDENTIAL_ENV
            )));
        }

        Err(Error::Auth(format!(
            "no supported authentication method (offered: {})",
            info.auth_methods.join(",")
        )))
    }

    /// Add an ephemeral onion service using a locally generated identity.
    ///
    /// The key format for ADD_ONION with Ed25519-V3 is:
    /// ED25519-V3:<base64-encoded expanded secret key>
    ///
    /// `Flags=DiscardPK` keeps Tor from echoing the key back. The service
    /// lives until DEL_ONION or until this control connection closes.
    pub async fn add_onion(
        &mut self,
        identity: &OnionIdentity,
        virtual_port: u16,
        target: SocketAddr,
    ) -> Result<String> {
        if !self.authenticated {
            return Err(Error::NotAuthenticated);
        }

        let key_b64 = Zeroizing::new(BASE64.encode(identity.expanded_secret_key().as_slice()));

        let cmd = Zeroizing::new(format!(
            "ADD_ONION ED25519-V3:{} Flags=DiscardPK Port={},{}",
            key_b64.as_str(),
            virtual_port,
            target
        ));

        let response = self.command(&cmd).await?;

        let service_id = response
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| Error::Tor("no ServiceID in response".into()))?;

        OnionAddress::from_service_id(&service_id)?;

        let expected_hostname = identity.onion_address().hostname();
        if service_id != expected_hostname {
            tracing::warn!(
                expected = %expected_hostname,
                got = %service_id,
                "Onion address mismatch - Tor generated different address"
            );
        }

        tracing::info!(
            service_id = %service_id,
            virtual_port = virtual_port,
            target = %target,
            "Created onion service"
        );

        Ok(service_id)
    }

    /// Remove an onion service.
    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        if !self.authenticated {
            return Err(Error::NotAuthenticated);
        }

        self.command(&format!("DEL_ONION {}", service_id)).await?;

        tracing::info!(service_id = %service_id, "Removed onion service");
        Ok(())
    }

    /// Query a single GETINFO key.
    pub async fn get_info(&mut self, key: &str) -> Result<String> {
        let lines = self.command(&format!("GETINFO {}", key)).await?;
        let prefix = format!("{}=", key);

        lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(|value| value.trim_start_matches('\n').to_string())
            .ok_or_else(|| Error::Tor(format!("{} not found in response", key)))
    }

    /// Get Tor version.
    pub async fn get_version(&mut self) -> Result<String> {
        self.get_info("version").await
    }

    /// TCP SOCKS listeners Tor is currently accepting connections on.
    ///
    /// Unix socket listeners are skipped.
    pub async fn socks_listeners(&mut self) -> Result<Vec<SocketAddr>> {
        let value = self.get_info("net/listeners/socks").await?;

        Ok(parse_quoted_list(&value)
            .into_iter()
            .filter_map(|entry| entry.parse().ok())
            .collect())
    }
}

/// Information from PROTOCOLINFO response.
#[derive(Debug, Default, Clone)]
pub struct ProtocolInfo {
    /// Available authentication methods.
    pub auth_methods: Vec<String>,
    /// Path to control port cookie file for authentication.
    pub cookie_file: Option<PathBuf>,
    /// Tor version string.
    pub version: Option<String>,
}

impl ProtocolInfo {
    /// Whether Tor offered `method`.
    pub fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Pick the first readable cookie file, preferring the one Tor reported.
fn find_cookie_file(reported: Option<&Path>) -> Result<PathBuf> {
    let candidates = reported
        .into_iter()
        .map(Path::to_path_buf)
        .chain(COOKIE_LOCATIONS.iter().map(PathBuf::from));

    for path in candidates {
        match std::fs::File::open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if Some(path.as_path()) == reported => {
                tracing::warn!(
                    "Cannot read cookie file {}: {}. \
                    You may need to add your user to the 'debian-tor' group: \
                    sudo usermod -a -G debian-tor $USER && newgrp debian-tor",
                    path.display(),
                    e
                );
            }
            Err(e) => tracing::debug!("Cookie file {} unusable: {}", path.display(), e),
        }
    }

    Err(Error::Auth("no readable control auth cookie file".into()))
}

fn read_cookie(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let cookie = Zeroizing::new(
        std::fs::read(path).map_err(|e| Error::Auth(format!("failed to read cookie file {}: {}", path.display(), e)))?,
    );

    if cookie.len() != COOKIE_LEN {
        return Err(Error::Auth(format!(
            "cookie file {} is {} bytes, expected {}",
            path.display(),
            cookie.len(),
            COOKIE_LEN
        )));
    }

    Ok(cookie)
}

/// HMAC-SHA256(key, cookie || client_nonce || server_nonce).
fn safecookie_hash(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::Auth(format!("hmac: {}", e)))?;
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
}

/// Split `NNN<sep><body>` into its parts.
fn split_status_line(line: &str) -> Result<(u16, char, &str)> {
    let malformed = || Error::Tor(format!("malformed control reply: {:?}", line));

    let status = line.get(..3).ok_or_else(malformed)?;
    if !status.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let code: u16 = status.parse().map_err(|_| malformed())?;

    let mut rest = line[3..].chars();
    let separator = rest.next().unwrap_or(' ');
    if !matches!(separator, ' ' | '-' | '+') {
        return Err(malformed());
    }

    Ok((code, separator, rest.as_str()))
}

/// Parse `KEY=value KEY="quoted value" FLAG` sequences.
fn parse_kv(s: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ' ' {
                break;
            }
            key.push(c);
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                value = read_quoted(&mut chars);
            } else {
                value = read_bare(&mut chars);
            }
        }

        pairs.push((key, value));
    }

    pairs
}

/// Parse a space separated list of quoted (or bare) strings.
fn parse_quoted_list(s: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(' ' | '\n')) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('"') => {
                chars.next();
                items.push(read_quoted(&mut chars));
            }
            Some(_) => items.push(read_bare(&mut chars)),
        }
    }

    items
}

fn read_bare(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut value = String::new();
    while let Some(&c) = chars.peek() {
        if c == ' ' || c == '\n' {
            break;
        }
        value.push(c);
        chars.next();
    }
    value
}

/// Read up to the closing quote, resolving backslash escapes.
fn read_quoted(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('r') => value.push('\r'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => break,
            },
            _ => value.push(c),
        }
    }
    value
}

/// Escape a string for Tor control protocol.
fn escape_tor_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
