use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::CONTROL_IO_TIMEOUT;
use crate::error::BridgeError;

const SERVER_TO_CONTROLLER_KEY: &[u8] =
    b"Tor safe cookie authentication server-to-controller hash";
const CONTROLLER_TO_SERVER_KEY: &[u8] =
    b"Tor safe cookie authentication controller-to-server hash";

const COOKIE_FILE: &str = "control_auth_cookie";
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

struct ChannelIo {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// One authenticated session on the daemon's control port.
///
/// Commands are serialized under the channel lock; any I/O error or
/// unexpected reply tears the session down, which callers observe through
/// [`ControlChannel::is_live`].
pub struct ControlChannel {
    socks_port: u16,
    io: Mutex<Option<ChannelIo>>,
    live: AtomicBool,
    process: Mutex<Option<Child>>,
    owns_process: AtomicBool,
    keepalive_busy: Arc<AtomicBool>,
}

impl ControlChannel {
    /// Connect and authenticate. On success the daemon's lifetime is bound
    /// to this controller via TAKEOWNERSHIP, and a keepalive task holds the
    /// session open. Process ownership is attached separately with
    /// [`ControlChannel::adopt_process`] so a failed handshake leaves the
    /// caller free to retry against the same daemon.
    pub fn connect(
        data_dir: &Path,
        control_port: u16,
        socks_port: u16,
    ) -> Result<Arc<ControlChannel>, BridgeError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, control_port));
        let stream = TcpStream::connect_timeout(&addr, CONTROL_IO_TIMEOUT)?;

        stream.set_read_timeout(Some(CONTROL_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(CONTROL_IO_TIMEOUT))?;

        let reader = BufReader::new(stream.try_clone()?);

        let channel = Arc::new(ControlChannel {
            socks_port,
            io: Mutex::new(Some(ChannelIo { reader, writer: stream })),
            live: AtomicBool::new(true),
            process: Mutex::new(None),
            owns_process: AtomicBool::new(false),
            keepalive_busy: Arc::new(AtomicBool::new(false)),
        });

        if let Err(e) = channel.handshake(data_dir) {
            channel.close(Some(&format!("handshake failed: {}", e)));
            return Err(e);
        }

        spawn_keepalive(Arc::downgrade(&channel));

        Ok(channel)
    }

    /// Take ownership of the daemon process: closing this channel will now
    /// terminate it.
    pub fn adopt_process(&self, child: Child) {
        *self.process.lock().unwrap() = Some(child);
        self.owns_process.store(true, Ordering::SeqCst);
    }

    fn handshake(&self, data_dir: &Path) -> Result<(), BridgeError> {
        let mut client_nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut client_nonce);

        let reply = self.send_and_receive(&format!(
            "AUTHCHALLENGE SAFECOOKIE {}",
            hex::encode_upper(client_nonce)
        ))?;

        let rest = reply
            .strip_prefix("250 AUTHCHALLENGE ")
            .ok_or_else(|| BridgeError::Handshake(format!("AUTHCHALLENGE reply invalid: {}", reply)))?;

        let (server_hash, server_nonce) = parse_authchallenge(rest)?;

        let cookie_path = data_dir.join(COOKIE_FILE);
        let cookie = fs::read(&cookie_path).map_err(|e| {
            BridgeError::Handshake(format!("cookie {} unreadable: {}", cookie_path.display(), e))
        })?;

        verify_server_hash(&cookie, &client_nonce, &server_nonce, &server_hash)?;

        let response = compute_client_response(&cookie, &client_nonce, &server_nonce)?;

        let reply = self.send_and_receive(&format!("AUTHENTICATE {}", hex::encode_upper(response)))?;
        if !reply.starts_with("250") {
            return Err(BridgeError::Handshake(format!(
                "AUTHENTICATE reply invalid: {}",
                reply
            )));
        }

        let reply = self.send_and_receive("TAKEOWNERSHIP")?;
        if !reply.starts_with("250") {
            return Err(BridgeError::Handshake(format!(
                "TAKEOWNERSHIP reply invalid: {}",
                reply
            )));
        }

        let reply = self.send_and_receive("RESETCONF __OwningControllerProcess")?;
        if !reply.starts_with("250") {
            return Err(BridgeError::Handshake(format!(
                "RESETCONF reply invalid: {}",
                reply
            )));
        }

        let version = self.get_info("version")?;
        info!(version = %version, "control channel established");

        Ok(())
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Issue a single command and read one reply line.
    fn send_and_receive(&self, command: &str) -> Result<String, BridgeError> {
        let result = {
            let mut guard = self.io.lock().unwrap();
            let io = guard
                .as_mut()
                .ok_or_else(|| BridgeError::Protocol("channel closed".into()))?;
            write_line(io, command).and_then(|_| read_line(io))
        };

        match result {
            Ok(line) => Ok(line),
            Err(e) => {
                self.close(Some(&e.to_string()));
                Err(e)
            }
        }
    }

    /// GETINFO with multi-line reply handling; returns the value text.
    pub fn get_info(&self, key: &str) -> Result<String, BridgeError> {
        let result = {
            let mut guard = self.io.lock().unwrap();
            let io = guard
                .as_mut()
                .ok_or_else(|| BridgeError::Protocol("channel closed".into()))?;

            write_line(io, &format!("GETINFO {}", key)).and_then(|_| {
                let mut value = String::new();
                loop {
                    let reply = read_line(io)?;

                    if !reply.starts_with("250") {
                        return Err(BridgeError::Protocol(format!("unexpected reply: {}", reply)));
                    }
                    if reply == "250 OK" {
                        return Ok(value);
                    }
                    if reply.len() > 4 {
                        value = reply[4..].to_string();
                    }
                }
            })
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.close(Some(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Graceful or forced daemon shutdown, then close the channel. If the
    /// signal cannot be delivered the owned process is terminated directly.
    pub fn shutdown(&self, force: bool) {
        let signal = if force { "SIGNAL HALT" } else { "SIGNAL SHUTDOWN" };

        if let Err(e) = self.send_and_receive(signal) {
            debug!(error = %e, "shutdown signal failed");
        }

        self.close(Some("shutdown"));
    }

    /// Idempotent teardown: closes the socket, marks the session dead and
    /// terminates the daemon when this controller owns it.
    pub fn close(&self, reason: Option<&str>) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(reason) = reason {
            info!(reason, "control connection closed");
        }

        if let Some(io) = self.io.lock().unwrap().take() {
            let _ = io.writer.shutdown(Shutdown::Both);
        }

        if self.owns_process.load(Ordering::SeqCst) {
            if let Some(mut child) = self.process.lock().unwrap().take() {
                if let Err(e) = child.kill() {
                    debug!(error = %e, "daemon already gone");
                }
                let _ = child.wait();
            }
        }
    }

}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close(None);
    }
}

fn write_line(io: &mut ChannelIo, line: &str) -> Result<(), BridgeError> {
    io.writer.write_all(format!("{}\r\n", line).as_bytes())?;
    io.writer.flush()?;
    Ok(())
}

fn read_line(io: &mut ChannelIo) -> Result<String, BridgeError> {
    let mut line = String::new();
    let read = io.reader.read_line(&mut line)?;

    if read == 0 {
        return Err(BridgeError::Protocol("unexpected end of stream".into()));
    }

    Ok(line.trim().to_string())
}

fn parse_authchallenge(rest: &str) -> Result<(Vec<u8>, Vec<u8>), BridgeError> {
    let mut server_hash = None;
    let mut server_nonce = None;

    for field in rest.split_whitespace() {
        if let Some(hex_hash) = field.strip_prefix("SERVERHASH=") {
            server_hash = Some(hex::decode(hex_hash).map_err(|e| {
                BridgeError::Handshake(format!("bad SERVERHASH encoding: {}", e))
            })?);
        } else if let Some(hex_nonce) = field.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(hex::decode(hex_nonce).map_err(|e| {
                BridgeError::Handshake(format!("bad SERVERNONCE encoding: {}", e))
            })?);
        }
    }

    match (server_hash, server_nonce) {
        (Some(hash), Some(nonce)) => Ok((hash, nonce)),
        _ => Err(BridgeError::Handshake(
            "AUTHCHALLENGE reply missing hash or nonce".into(),
        )),
    }
}

fn safecookie_mac(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<Hmac<Sha256>, BridgeError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| BridgeError::Handshake(format!("hmac init: {}", e)))?;
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    Ok(mac)
}

/// Check the server proved knowledge of the cookie.
pub fn verify_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    server_hash: &[u8],
) -> Result<(), BridgeError> {
    let mac = safecookie_mac(SERVER_TO_CONTROLLER_KEY, cookie, client_nonce, server_nonce)?;

    mac.verify_slice(server_hash)
        .map_err(|_| BridgeError::Handshake("server hash incorrect".into()))
}

/// The controller's half of the SAFECOOKIE exchange.
pub fn compute_client_response(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<Vec<u8>, BridgeError> {
    let mac = safecookie_mac(CONTROLLER_TO_SERVER_KEY, cookie, client_nonce, server_nonce)?;
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Used by tests standing in for the daemon side of the handshake.
pub fn compute_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<Vec<u8>, BridgeError> {
    let mac = safecookie_mac(SERVER_TO_CONTROLLER_KEY, cookie, client_nonce, server_nonce)?;
    Ok(mac.finalize().into_bytes().to_vec())
}

fn spawn_keepalive(channel: Weak<ControlChannel>) {
    thread::Builder::new()
        .name("control-keepalive".into())
        .spawn(move || loop {
            thread::sleep(KEEPALIVE_PERIOD);

            let Some(channel) = channel.upgrade() else {
                return;
            };
            if !channel.is_live() {
                return;
            }

            // Single flight: skip the tick if the previous probe is still
            // waiting on the daemon.
            if channel.keepalive_busy.swap(true, Ordering::SeqCst) {
                continue;
            }

            let busy = Arc::clone(&channel.keepalive_busy);
            let probe = Arc::clone(&channel);
            let result = thread::Builder::new()
                .name("control-keepalive-probe".into())
                .spawn(move || {
                    if let Err(e) = probe.get_info("version") {
                        warn!(error = %e, "keepalive probe failed");
                    }
                    busy.store(false, Ordering::SeqCst);
                });

            if result.is_err() {
                channel.keepalive_busy.store(false, Ordering::SeqCst);
                return;
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    const COOKIE: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

    /// Minimal control-server double speaking just enough of the protocol
    /// for one full handshake.
    fn spawn_fake_daemon(tamper_hash: bool) -> (u16, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(COOKIE_FILE), COOKIE).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;

            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let client_nonce = hex::decode(
                line.trim()
                    .strip_prefix("AUTHCHALLENGE SAFECOOKIE ")
                    .unwrap(),
            )
            .unwrap();

            let server_nonce = [7u8; 32];
            let mut server_hash =
                compute_server_hash(COOKIE, &client_nonce, &server_nonce).unwrap();
            if tamper_hash {
                server_hash[0] ^= 0xff;
            }

            writer
                .write_all(
                    format!(
                        "250 AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}\r\n",
                        hex::encode_upper(&server_hash),
                        hex::encode_upper(server_nonce)
                    )
                    .as_bytes(),
                )
                .unwrap();

            let expected =
                compute_client_response(COOKIE, &client_nonce, &server_nonce).unwrap();

            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                return;
            }
            let got = hex::decode(line.trim().strip_prefix("AUTHENTICATE ").unwrap()).unwrap();
            if got != expected {
                writer.write_all(b"515 Authentication failed\r\n").unwrap();
                return;
            }
            writer.write_all(b"250 OK\r\n").unwrap();

            for expected_cmd in ["TAKEOWNERSHIP", "RESETCONF __OwningControllerProcess"] {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                assert_eq!(line.trim(), expected_cmd);
                writer.write_all(b"250 OK\r\n").unwrap();
            }

            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "GETINFO version");
            writer
                .write_all(b"250-version=0.4.8.10\r\n250 OK\r\n")
                .unwrap();

            // Stay open so the channel remains live until dropped.
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
        });

        (port, dir)
    }

    #[test]
    fn handshake_succeeds_against_conforming_server() {
        let (port, dir) = spawn_fake_daemon(false);

        let channel = ControlChannel::connect(dir.path(), port, 29101).unwrap();
        assert!(channel.is_live());
        assert_eq!(channel.socks_port(), 29101);
    }

    #[test]
    fn tampered_server_hash_fails_handshake() {
        let (port, dir) = spawn_fake_daemon(true);

        let result = ControlChannel::connect(dir.path(), port, 29101);
        match result {
            Err(BridgeError::Handshake(msg)) => assert!(msg.contains("server hash")),
            other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn server_hash_round_trip() {
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];

        let hash = compute_server_hash(COOKIE, &client_nonce, &server_nonce).unwrap();
        assert!(verify_server_hash(COOKIE, &client_nonce, &server_nonce, &hash).is_ok());

        let mut bad = hash.clone();
        bad[5] ^= 1;
        assert!(verify_server_hash(COOKIE, &client_nonce, &server_nonce, &bad).is_err());
    }

    #[test]
    fn controller_and_server_hashes_differ() {
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];

        let server = compute_server_hash(COOKIE, &client_nonce, &server_nonce).unwrap();
        let client = compute_client_response(COOKIE, &client_nonce, &server_nonce).unwrap();
        assert_ne!(server, client);
    }

    #[test]
    fn authchallenge_parser_requires_both_fields() {
        assert!(parse_authchallenge("SERVERHASH=AA").is_err());
        assert!(parse_authchallenge("SERVERNONCE=BB").is_err());

        let (hash, nonce) = parse_authchallenge("SERVERHASH=AABB SERVERNONCE=CCDD").unwrap();
        assert_eq!(hash, vec![0xaa, 0xbb]);
        assert_eq!(nonce, vec![0xcc, 0xdd]);
    }
}
