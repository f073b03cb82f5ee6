use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use scopeguard::defer;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::DIAL_TIMEOUT;
use crate::error::BridgeError;
use crate::observability;
use crate::relay::relay_duplex;
use crate::socks_client::connect_via_socks;

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;
const AUTH_SUBNEG_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Concurrent relay cap; connections past this are rejected at accept.
pub const SOCKS_CONNECTION_CAP: usize = 32;

/// Where a bridged connection must go: the destination name and the SOCKS
/// upstream carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRoute {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub dest_host: String,
}

/// Resolves destinations for the bridge. Implemented by the coordinator,
/// which owns the virtual-address table and the active upstream endpoint.
pub trait UpstreamRouter: Send + Sync + 'static {
    /// Direct mode: recover the route a virtual address was minted for.
    fn route_virtual(&self, addr: Ipv4Addr) -> Option<SocksRoute>;

    /// Filtering mode: pick an upstream for an unresolved hostname.
    fn route_hostname(&self, host: &str) -> Result<SocksRoute, BridgeError>;
}

/// How destination addresses are expected to arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// Destinations arrive pre-resolved as 10.0.0.0/8 virtual addresses.
    Direct,
    /// Destinations arrive as hostnames and route by suffix.
    Filtering,
}

/// Local SOCKS listener relaying admitted connections to an upstream SOCKS
/// endpoint. Unauthenticated; client credentials, when offered, are captured
/// for upstream stream isolation only.
pub struct SocksBridge {
    port: u16,
    mode: BridgeMode,
    active: Arc<AtomicUsize>,
    cap: usize,
    shutdown: Arc<AtomicBool>,
}

impl SocksBridge {
    pub fn start(
        port: u16,
        mode: BridgeMode,
        router: Arc<dyn UpstreamRouter>,
    ) -> Result<Arc<Self>, BridgeError> {
        Self::start_with_cap(port, mode, router, SOCKS_CONNECTION_CAP)
    }

    pub fn start_with_cap(
        port: u16,
        mode: BridgeMode,
        router: Arc<dyn UpstreamRouter>,
        cap: usize,
    ) -> Result<Arc<Self>, BridgeError> {
        let listener = bind_reusable(port)?;
        let port = listener.local_addr()?.port();

        let bridge = Arc::new(SocksBridge {
            port,
            mode,
            active: Arc::new(AtomicUsize::new(0)),
            cap,
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        info!(port, ?mode, "SOCKS bridge listening");

        let accept_bridge = Arc::clone(&bridge);
        thread::Builder::new()
            .name(format!("socks-accept-{}", port))
            .spawn(move || accept_loop(listener, accept_bridge, router))
            .map_err(|e| BridgeError::Io(e))?;

        Ok(bridge)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting. A wake connect unblocks the accept loop so the
    /// listener actually goes away.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let _ = TcpStream::connect_timeout(&addr, std::time::Duration::from_secs(1));
    }
}

fn bind_reusable(port: u16) -> Result<TcpListener, BridgeError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, port)).into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

fn accept_loop(listener: TcpListener, bridge: Arc<SocksBridge>, router: Arc<dyn UpstreamRouter>) {
    let mut saturated_logged = false;

    loop {
        let (client, _peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if bridge.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                debug!(error = %e, "accept failed");
                continue;
            }
        };

        if bridge.shutdown.load(Ordering::SeqCst) {
            return;
        }

        if bridge.active.load(Ordering::SeqCst) >= bridge.cap {
            if !saturated_logged {
                warn!(cap = bridge.cap, "too many SOCKS connections, rejecting");
                saturated_logged = true;
            }
            observability::record_socks_connection_rejected();
            let _ = client.shutdown(Shutdown::Both);
            continue;
        }
        saturated_logged = false;

        bridge.active.fetch_add(1, Ordering::SeqCst);
        observability::record_socks_connection_opened();

        let active = Arc::clone(&bridge.active);
        let mode = bridge.mode;
        let router = Arc::clone(&router);

        let spawned = thread::Builder::new()
            .name("socks-conn".into())
            .spawn(move || {
                defer! {
                    active.fetch_sub(1, Ordering::SeqCst);
                }
                if let Err(e) = handle_connection(mode, router, client) {
                    debug!(error = %e, "SOCKS connection ended");
                }
            });

        if spawned.is_err() {
            bridge.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

enum DestAddr {
    Ip(Ipv4Addr),
    Domain(String),
}

fn handle_connection(
    mode: BridgeMode,
    router: Arc<dyn UpstreamRouter>,
    mut client: TcpStream,
) -> Result<(), BridgeError> {
    client.set_read_timeout(Some(DIAL_TIMEOUT))?;
    client.set_write_timeout(Some(DIAL_TIMEOUT))?;

    let credentials = greet(&mut client)?;
    let (dest, dest_port) = read_request(&mut client)?;

    let route = match (mode, dest) {
        (BridgeMode::Direct, DestAddr::Ip(addr)) => {
            if addr.octets()[0] != 10 {
                reply(&mut client, REP_ADDRESS_NOT_SUPPORTED)?;
                return Err(BridgeError::UpstreamDial(
                    "destination outside the virtual range".into(),
                ));
            }
            match router.route_virtual(addr) {
                Some(route) => route,
                None => {
                    reply(&mut client, REP_HOST_UNREACHABLE)?;
                    return Err(BridgeError::UpstreamDial(
                        "virtual address not found".into(),
                    ));
                }
            }
        }
        (BridgeMode::Direct, DestAddr::Domain(_)) => {
            reply(&mut client, REP_ADDRESS_NOT_SUPPORTED)?;
            return Err(BridgeError::UpstreamDial(
                "direct mode requires a resolved address".into(),
            ));
        }
        (BridgeMode::Filtering, DestAddr::Domain(host)) => match router.route_hostname(&host) {
            Ok(route) => route,
            Err(e) => {
                reply(&mut client, REP_GENERAL_FAILURE)?;
                return Err(e);
            }
        },
        (BridgeMode::Filtering, DestAddr::Ip(_)) => {
            reply(&mut client, REP_ADDRESS_NOT_SUPPORTED)?;
            return Err(BridgeError::UpstreamDial(
                "filtering mode requires an unresolved address".into(),
            ));
        }
    };

    let creds = credentials
        .as_ref()
        .map(|(user, pass)| (user.as_str(), pass.as_str()));

    let upstream = match connect_via_socks(
        &route.upstream_host,
        route.upstream_port,
        &route.dest_host,
        dest_port,
        creds,
        DIAL_TIMEOUT,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            reply(&mut client, REP_CONNECTION_REFUSED)?;
            return Err(e);
        }
    };

    reply(&mut client, REP_SUCCESS)?;

    relay_duplex(client, upstream)?;

    Ok(())
}

/// Method negotiation. Username/password is selected when offered so the
/// upstream sees the client's stream-isolation credentials.
fn greet(client: &mut TcpStream) -> Result<Option<(String, String)>, BridgeError> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head)?;

    if head[0] != SOCKS5_VERSION {
        return Err(BridgeError::UpstreamDial(format!(
            "unsupported SOCKS version {}",
            head[0]
        )));
    }

    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods)?;

    if methods.contains(&AUTH_USERNAME_PASSWORD) {
        client.write_all(&[SOCKS5_VERSION, AUTH_USERNAME_PASSWORD])?;
        return read_credentials(client).map(Some);
    }

    if methods.contains(&AUTH_NO_AUTH) {
        client.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH])?;
        return Ok(None);
    }

    client.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])?;
    Err(BridgeError::UpstreamDial(
        "client offered no supported auth method".into(),
    ))
}

fn read_credentials(client: &mut TcpStream) -> Result<(String, String), BridgeError> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head)?;

    if head[0] != AUTH_SUBNEG_VERSION {
        return Err(BridgeError::UpstreamDial(
            "bad credential subnegotiation version".into(),
        ));
    }

    let mut username = vec![0u8; head[1] as usize];
    client.read_exact(&mut username)?;

    let mut plen = [0u8; 1];
    client.read_exact(&mut plen)?;
    let mut password = vec![0u8; plen[0] as usize];
    client.read_exact(&mut password)?;

    client.write_all(&[AUTH_SUBNEG_VERSION, 0x00])?;

    Ok((
        String::from_utf8_lossy(&username).into_owned(),
        String::from_utf8_lossy(&password).into_owned(),
    ))
}

fn read_request(client: &mut TcpStream) -> Result<(DestAddr, u16), BridgeError> {
    let mut head = [0u8; 4];
    client.read_exact(&mut head)?;

    if head[0] != SOCKS5_VERSION {
        return Err(BridgeError::UpstreamDial("malformed SOCKS request".into()));
    }

    if head[1] != CMD_CONNECT {
        reply(client, REP_COMMAND_NOT_SUPPORTED)?;
        return Err(BridgeError::UpstreamDial(format!(
            "unsupported SOCKS command {}",
            head[1]
        )));
    }

    let dest = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets)?;
            DestAddr::Ip(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name)?;
            DestAddr::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets)?;
            reply(client, REP_ADDRESS_NOT_SUPPORTED)?;
            return Err(BridgeError::UpstreamDial(
                "IPv6 destinations are not bridged".into(),
            ));
        }
        other => {
            reply(client, REP_ADDRESS_NOT_SUPPORTED)?;
            return Err(BridgeError::UpstreamDial(format!(
                "unknown address type {}",
                other
            )));
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port)?;

    Ok((dest, u16::from_be_bytes(port)))
}

fn reply(client: &mut TcpStream, code: u8) -> Result<(), BridgeError> {
    client.write_all(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    struct StaticRouter {
        upstream_port: u16,
    }

    impl UpstreamRouter for StaticRouter {
        fn route_virtual(&self, addr: Ipv4Addr) -> Option<SocksRoute> {
            if addr == Ipv4Addr::new(10, 1, 2, 3) {
                Some(SocksRoute {
                    upstream_host: "127.0.0.1".into(),
                    upstream_port: self.upstream_port,
                    dest_host: "dest.example.com".into(),
                })
            } else {
                None
            }
        }

        fn route_hostname(&self, host: &str) -> Result<SocksRoute, BridgeError> {
            Ok(SocksRoute {
                upstream_host: "127.0.0.1".into(),
                upstream_port: self.upstream_port,
                dest_host: host.to_string(),
            })
        }
    }

    /// SOCKS upstream double that accepts one CONNECT then echoes payload.
    fn echo_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut head = [0u8; 2];
            stream.read_exact(&mut head).unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            stream.read_exact(&mut methods).unwrap();
            stream.write_all(&[0x05, 0x00]).unwrap();

            let mut req = [0u8; 4];
            stream.read_exact(&mut req).unwrap();
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();

            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        port
    }

    fn socks_connect_virtual(bridge_port: u16, addr: Ipv4Addr) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", bridge_port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&addr.octets());
        request.extend_from_slice(&443u16.to_be_bytes());
        stream.write_all(&request).unwrap();

        stream
    }

    fn read_reply_code(stream: &mut TcpStream) -> u8 {
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        reply[1]
    }

    #[test]
    fn direct_mode_relays_through_the_token_route() {
        let upstream_port = echo_upstream();
        let bridge = SocksBridge::start(
            0,
            BridgeMode::Direct,
            Arc::new(StaticRouter { upstream_port }),
        )
        .unwrap();

        let mut client = socks_connect_virtual(bridge.port(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(read_reply_code(&mut client), REP_SUCCESS);

        client.write_all(b"through the tunnel").unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"through the tunnel");

        bridge.stop();
    }

    #[test]
    fn unknown_virtual_address_fails_the_connect() {
        let upstream_port = echo_upstream();
        let bridge = SocksBridge::start(
            0,
            BridgeMode::Direct,
            Arc::new(StaticRouter { upstream_port }),
        )
        .unwrap();

        let mut client = socks_connect_virtual(bridge.port(), Ipv4Addr::new(10, 9, 9, 9));
        assert_eq!(read_reply_code(&mut client), REP_HOST_UNREACHABLE);

        bridge.stop();
    }

    #[test]
    fn direct_mode_rejects_hostnames() {
        let upstream_port = echo_upstream();
        let bridge = SocksBridge::start(
            0,
            BridgeMode::Direct,
            Arc::new(StaticRouter { upstream_port }),
        )
        .unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", bridge.port())).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 4];
        request.extend_from_slice(b"a.io");
        request.extend_from_slice(&80u16.to_be_bytes());
        stream.write_all(&request).unwrap();

        assert_eq!(read_reply_code(&mut stream), REP_ADDRESS_NOT_SUPPORTED);

        bridge.stop();
    }

    #[test]
    fn connections_past_the_cap_are_rejected() {
        let upstream_port = echo_upstream();
        let bridge = SocksBridge::start_with_cap(
            0,
            BridgeMode::Direct,
            Arc::new(StaticRouter { upstream_port }),
            2,
        )
        .unwrap();

        // Two live connections parked mid-greeting.
        let mut held = Vec::new();
        for _ in 0..2 {
            let mut stream = TcpStream::connect(("127.0.0.1", bridge.port())).unwrap();
            stream.write_all(&[0x05, 0x01]).unwrap();
            held.push(stream);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bridge.active_connections() < 2 {
            assert!(std::time::Instant::now() < deadline, "handlers never started");
            thread::sleep(Duration::from_millis(10));
        }

        // The third connection is closed without any SOCKS exchange, while
        // the first two stay up.
        let mut rejected = TcpStream::connect(("127.0.0.1", bridge.port())).unwrap();
        rejected
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        let eof = matches!(rejected.read(&mut buf), Ok(0) | Err(_));
        assert!(eof, "33rd-style connection should be dropped");
        assert_eq!(bridge.active_connections(), 2);

        bridge.stop();
    }
}
