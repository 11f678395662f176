//! TorSession against a scripted control port and SOCKS proxy on loopback.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use torcat_core::tor::{ControlAddr, TorSession};
use torcat_core::{run_mode, Error, Mode, SessionProvider};

const WAIT: Duration = Duration::from_secs(5);
const SERVICE_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

type CommandLog = Arc<Mutex<Vec<String>>>;

/// Accept one control connection and answer each command line with `handler`.
async fn fake_tor<H>(mut handler: H) -> (ControlAddr, CommandLog)
where
    H: FnMut(&str) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = CommandLog::default();
    let seen = Arc::clone(&log);

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            seen.lock().unwrap().push(line.clone());
            let reply = handler(&line);
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (ControlAddr::parse(&addr.to_string()).unwrap(), log)
}

/// Replies of a Tor daemon with `CookieAuthentication 0` and no password.
fn open_tor(line: &str) -> Option<String> {
    let reply = match line {
        "PROTOCOLINFO 1" => {
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n"
        }
        "AUTHENTICATE" => "250 OK\r\n",
        "GETINFO version" => "250-version=0.4.8.9\r\n250 OK\r\n",
        _ => return None,
    };
    Some(reply.to_string())
}

fn unrecognized() -> String {
    "510 Unrecognized command\r\n".to_string()
}

/// Pull the forwarding target out of `ADD_ONION ... Port=VPORT,TARGET`.
fn forward_target(command: &str) -> SocketAddr {
    command
        .split(' ')
        .find_map(|token| token.strip_prefix("Port="))
        .and_then(|port| port.split_once(','))
        .map(|(_, target)| target.parse().unwrap())
        .expect("ADD_ONION without a Port target")
}

async fn authenticated_session(addr: &ControlAddr) -> TorSession {
    let mut session = TorSession::open(addr).await.unwrap();
    session.authenticate(None).await.unwrap();
    session
}

#[tokio::test]
async fn test_listen_through_fake_tor() {
    let (addr, log) = fake_tor(|line: &str| {
        if let Some(reply) = open_tor(line) {
            return reply;
        }
        if line.starts_with("ADD_ONION ") {
            // Play the remote peer: Tor would forward its circuit here.
            let target = forward_target(line);
            tokio::spawn(async move {
                let mut peer = TcpStream::connect(target).await.unwrap();
                peer.write_all(b"hello\n").await.unwrap();
                peer.shutdown().await.unwrap();
            });
            return format!("250-ServiceID={}\r\n250 OK\r\n", SERVICE_ID);
        }
        if line.starts_with("DEL_ONION ") {
            return "250 OK\r\n".to_string();
        }
        unrecognized()
    })
    .await;

    let mut session = authenticated_session(&addr).await;

    let (stdin, _stdin_writer) = duplex(1024);
    let (stdout, mut stdout_reader) = duplex(1024);
    let announced = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&announced);

    timeout(
        WAIT,
        run_mode(
            &mut session,
            &Mode::Listen { port: 8080 },
            stdin,
            stdout,
            move |onion: &str| *sink.lock().unwrap() = Some(onion.to_string()),
        ),
    )
    .await
    .expect("conversation finished")
    .expect("clean conversation");

    let mut received = Vec::new();
    stdout_reader.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello\n");

    assert_eq!(
        announced.lock().unwrap().as_deref(),
        Some(format!("{}.onion", SERVICE_ID).as_str())
    );

    let commands = log.lock().unwrap().clone();
    assert_eq!(&commands[..3], ["PROTOCOLINFO 1", "AUTHENTICATE", "GETINFO version"]);

    let add = &commands[3];
    assert!(add.starts_with("ADD_ONION ED25519-V3:"));
    assert!(add.contains(" Flags=DiscardPK "));
    assert!(add.contains(" Port=8080,127.0.0.1:"));

    assert_eq!(commands[4], format!("DEL_ONION {}", SERVICE_ID));
}

#[tokio::test]
async fn test_add_onion_rejected() {
    let (addr, _log) = fake_tor(|line: &str| {
        open_tor(line).unwrap_or_else(|| {
            if line.starts_with("ADD_ONION ") {
                "512 Invalid VIRTPORT/TARGET\r\n".to_string()
            } else {
                unrecognized()
            }
        })
    })
    .await;

    let mut session = authenticated_session(&addr).await;

    match session.publish(8080).await {
        Err(Error::Listen(message)) => assert!(message.contains("512")),
        Err(other) => panic!("expected listen error, got {:?}", other),
        Ok(_) => panic!("publish should fail"),
    }
}

/// What the fake SOCKS proxy saw in the CONNECT request.
#[derive(Debug, PartialEq)]
struct SocksRequest {
    host: String,
    port: u16,
}

/// Serve one SOCKS5 CONNECT with reply code `status`, then send `payload`.
async fn fake_socks(status: u8, payload: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<SocksRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        socket.write_all(&[0x05, 0x00]).await.unwrap();

        let mut header = [0u8; 5];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], [0x05, 0x01, 0x00, 0x03], "hostname must not be resolved locally");
        let mut host = vec![0u8; header[4] as usize];
        socket.read_exact(&mut host).await.unwrap();
        let mut port = [0u8; 2];
        socket.read_exact(&mut port).await.unwrap();

        socket
            .write_all(&[0x05, status, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        if status == 0x00 {
            socket.write_all(payload).await.unwrap();
        }

        SocksRequest {
            host: String::from_utf8(host).unwrap(),
            port: u16::from_be_bytes(port),
        }
    });

    (addr, handle)
}

fn tor_with_socks(socks: SocketAddr) -> impl FnMut(&str) -> String + Send + 'static {
    move |line: &str| {
        open_tor(line).unwrap_or_else(|| {
            if line == "GETINFO net/listeners/socks" {
                format!("250-net/listeners/socks=\"{}\"\r\n250 OK\r\n", socks)
            } else {
                unrecognized()
            }
        })
    }
}

#[tokio::test]
async fn test_dial_through_fake_socks() {
    let (socks, request) = fake_socks(0x00, b"pong").await;
    let (addr, _log) = fake_tor(tor_with_socks(socks)).await;
    let mut session = authenticated_session(&addr).await;

    let (stdin, _stdin_writer) = duplex(1024);
    let (stdout, mut stdout_reader) = duplex(1024);

    let mode = Mode::Connect {
        host: "example.onion".into(),
        port: 80,
    };
    timeout(WAIT, run_mode(&mut session, &mode, stdin, stdout, |_: &str| {}))
        .await
        .expect("conversation finished")
        .expect("clean conversation");

    let mut received = Vec::new();
    stdout_reader.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"pong");

    assert_eq!(
        request.await.unwrap(),
        SocksRequest {
            host: "example.onion".into(),
            port: 80
        }
    );
}

#[tokio::test]
async fn test_dial_failure_reports_destination() {
    let (socks, _request) = fake_socks(0x04, b"").await;
    let (addr, _log) = fake_tor(tor_with_socks(socks)).await;
    let mut session = authenticated_session(&addr).await;

    let err = session.dial("unreachable.onion", 443).await.unwrap_err();

    match &err {
        Error::Dial { destination, reason } => {
            assert_eq!(destination, "unreachable.onion:443");
            assert!(reason.contains("host unreachable"));
        }
        other => panic!("expected dial error, got {:?}", other),
    }
    assert!(err.is_setup());
}

#[tokio::test]
async fn test_dial_requires_authentication() {
    let (addr, log) = fake_tor(|line| open_tor(line).unwrap_or_else(unrecognized)).await;
    let mut session = TorSession::open(&addr).await.unwrap();

    assert!(matches!(
        session.dial("example.onion", 80).await,
        Err(Error::NotAuthenticated)
    ));
    assert!(matches!(session.publish(80).await, Err(Error::NotAuthenticated)));
    assert!(log.lock().unwrap().is_empty());
}

/// SOCKS proxy that accepts the connection and then never answers.
async fn silent_socks() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    addr
}

#[tokio::test]
async fn test_dial_times_out() {
    let socks = silent_socks().await;
    let (addr, _log) = fake_tor(tor_with_socks(socks)).await;
    let mut session = authenticated_session(&addr)
        .await
        .with_dial_timeout(Duration::from_millis(100));

    let err = timeout(WAIT, session.dial("x.onion", 80))
        .await
        .expect("dial bounded by its own timeout")
        .unwrap_err();

    match err {
        Error::Dial { destination, reason } => {
            assert_eq!(destination, "x.onion:80");
            assert!(reason.contains("timed out"), "unexpected reason {:?}", reason);
        }
        other => panic!("expected dial error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_socks_listener_falls_back_to_default() {
    let default_socks: SocketAddr = "127.0.0.1:9050".parse().unwrap();

    // Tor with SocksPort only on a unix socket reports no TCP listener.
    let (addr, _log) = fake_tor(|line: &str| {
        open_tor(line).unwrap_or_else(|| {
            if line == "GETINFO net/listeners/socks" {
                "250-net/listeners/socks=\r\n250 OK\r\n".to_string()
            } else {
                unrecognized()
            }
        })
    })
    .await;
    let session = authenticated_session(&addr).await;
    assert_eq!(session.socks_addr().await.unwrap(), default_socks);

    // Older Tor without the GETINFO key.
    let (addr, _log) = fake_tor(|line: &str| {
        open_tor(line).unwrap_or_else(|| "552 Unrecognized key \"net/listeners/socks\"\r\n".to_string())
    })
    .await;
    let session = authenticated_session(&addr).await;
    assert_eq!(session.socks_addr().await.unwrap(), default_socks);
}

#[tokio::test]
async fn test_socks_discovery_failure_names_destination() {
    let (addr, _log) = fake_tor(|line: &str| {
        open_tor(line).unwrap_or_else(|| {
            if line == "GETINFO net/listeners/socks" {
                "garbage\r\n".to_string()
            } else {
                unrecognized()
            }
        })
    })
    .await;
    let mut session = authenticated_session(&addr).await;

    let err = session.dial("hidden.onion", 80).await.unwrap_err();

    assert!(err.is_setup());
    match err {
        Error::Dial { destination, reason } => {
            assert_eq!(destination, "hidden.onion:80");
            assert!(reason.contains("SOCKS listener"), "unexpected reason {:?}", reason);
            assert!(reason.contains("malformed control reply"));
        }
        other => panic!("expected dial error, got {:?}", other),
    }
}

const SERVER_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CLIENT_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";
const SERVER_NONCE: [u8; 32] = [0x5a; 32];

fn hmac(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn cookie_file(name: &str, cookie: &[u8; 32]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("torcat-{}-{}.authcookie", std::process::id(), name));
    std::fs::write(&path, cookie).unwrap();
    path
}

/// Control port offering only SAFECOOKIE. With `forge` set it answers the
/// challenge with a hash that does not come from the cookie.
fn safecookie_tor(path: PathBuf, cookie: [u8; 32], forge: bool) -> impl FnMut(&str) -> String + Send + 'static {
    let mut client_nonce = Vec::new();

    move |line: &str| {
        if line == "PROTOCOLINFO 1" {
            return format!(
                "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"{}\"\r\n250 OK\r\n",
                path.display()
            );
        }
        if let Some(nonce) = line.strip_prefix("AUTHCHALLENGE SAFECOOKIE ") {
            client_nonce = hex::decode(nonce).unwrap();
            let server_hash = if forge {
                vec![0u8; 32]
            } else {
                hmac(SERVER_KEY, &[&cookie[..], &client_nonce[..], &SERVER_NONCE[..]])
            };
            return format!(
                "250 AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}\r\n",
                hex::encode_upper(server_hash),
                hex::encode_upper(SERVER_NONCE)
            );
        }
        if let Some(client_hash) = line.strip_prefix("AUTHENTICATE ") {
            let expected = hmac(CLIENT_KEY, &[&cookie[..], &client_nonce[..], &SERVER_NONCE[..]]);
            return if hex::decode(client_hash).ok() == Some(expected) {
                "250 OK\r\n".to_string()
            } else {
                "515 Authentication failed: Safe cookie response did not match expected value.\r\n".to_string()
            };
        }
        if line == "GETINFO version" {
            return "250-version=0.4.8.9\r\n250 OK\r\n".to_string();
        }
        unrecognized()
    }
}

#[tokio::test]
async fn test_safecookie_authentication() {
    let cookie = [0x42u8; 32];
    let path = cookie_file("good", &cookie);
    let (addr, log) = fake_tor(safecookie_tor(path.clone(), cookie, false)).await;

    let mut session = TorSession::open(&addr).await.unwrap();
    let result = session.authenticate(None).await;
    let _ = std::fs::remove_file(&path);
    result.expect("safecookie auth");

    let commands = log.lock().unwrap().clone();
    assert_eq!(commands[0], "PROTOCOLINFO 1");
    assert!(commands[1].starts_with("AUTHCHALLENGE SAFECOOKIE "));
    assert!(commands[2].starts_with("AUTHENTICATE "));
}

#[tokio::test]
async fn test_safecookie_forged_server_hash() {
    let cookie = [0x24u8; 32];
    let path = cookie_file("forged", &cookie);
    let (addr, log) = fake_tor(safecookie_tor(path.clone(), cookie, true)).await;

    let mut session = TorSession::open(&addr).await.unwrap();
    let result = session.authenticate(None).await;
    let _ = std::fs::remove_file(&path);

    let err = result.unwrap_err();
    assert!(err.is_auth_rejected());
    assert!(err.to_string().contains("server hash"));

    // The cookie-derived response is never sent to an impostor.
    assert!(!log
        .lock()
        .unwrap()
        .iter()
        .any(|command| command.starts_with("AUTHENTICATE")));
}

#[tokio::test]
async fn test_cookie_authentication() {
    let cookie = [0x17u8; 32];
    let path = cookie_file("plain", &cookie);
    let reported = path.clone();

    let (addr, log) = fake_tor(move |line: &str| {
        if line == "PROTOCOLINFO 1" {
            return format!(
                "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=COOKIE COOKIEFILE=\"{}\"\r\n250 OK\r\n",
                reported.display()
            );
        }
        if let Some(sent) = line.strip_prefix("AUTHENTICATE ") {
            return if hex::decode(sent).ok().as_deref() == Some(&cookie[..]) {
                "250 OK\r\n".to_string()
            } else {
                "515 Authentication failed: Wrong length on authentication cookie.\r\n".to_string()
            };
        }
        open_tor(line).unwrap_or_else(unrecognized)
    })
    .await;

    let mut session = TorSession::open(&addr).await.unwrap();
    let result = session.authenticate(None).await;
    let _ = std::fs::remove_file(&path);
    result.expect("cookie auth");

    let commands = log.lock().unwrap().clone();
    assert_eq!(commands[1], format!("AUTHENTICATE {}", hex::encode(cookie)));
}
