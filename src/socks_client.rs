use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::BridgeError;

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

/// CONNECT through an upstream SOCKS5 proxy to `dest_host:dest_port`.
///
/// Hostnames are passed through as domain addresses so resolution happens on
/// the far side. Credentials, when present, ride the dial only; the upstream
/// uses them for per-connection stream isolation.
pub fn connect_via_socks(
    upstream_host: &str,
    upstream_port: u16,
    dest_host: &str,
    dest_port: u16,
    credentials: Option<(&str, &str)>,
    timeout: Duration,
) -> Result<TcpStream, BridgeError> {
    let upstream_addr = (upstream_host, upstream_port)
        .to_socket_addrs()
        .map_err(|e| BridgeError::UpstreamDial(format!("resolve upstream: {}", e)))?
        .next()
        .ok_or_else(|| BridgeError::UpstreamDial("upstream resolves to nothing".into()))?;

    let mut stream = TcpStream::connect_timeout(&upstream_addr, timeout)
        .map_err(|e| BridgeError::UpstreamDial(format!("connect upstream: {}", e)))?;

    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    negotiate_method(&mut stream, credentials)?;
    send_connect(&mut stream, dest_host, dest_port)?;
    read_reply(&mut stream)?;

    Ok(stream)
}

fn negotiate_method(
    stream: &mut TcpStream,
    credentials: Option<(&str, &str)>,
) -> Result<(), BridgeError> {
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };

    stream.write_all(greeting)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;

    if choice[0] != SOCKS5_VERSION {
        return Err(BridgeError::UpstreamDial(format!(
            "upstream is not SOCKS5 (version {})",
            choice[0]
        )));
    }

    match choice[1] {
        AUTH_NO_AUTH => Ok(()),
        AUTH_USERNAME_PASSWORD => {
            let Some((username, password)) = credentials else {
                return Err(BridgeError::UpstreamDial(
                    "upstream demands credentials we do not hold".into(),
                ));
            };
            subnegotiate_credentials(stream, username, password)
        }
        AUTH_NO_ACCEPTABLE => Err(BridgeError::UpstreamDial(
            "upstream rejected our auth methods".into(),
        )),
        other => Err(BridgeError::UpstreamDial(format!(
            "upstream chose unsupported auth method {}",
            other
        ))),
    }
}

fn subnegotiate_credentials(
    stream: &mut TcpStream,
    username: &str,
    password: &str,
) -> Result<(), BridgeError> {
    if username.len() > 255 || password.len() > 255 {
        return Err(BridgeError::UpstreamDial("credentials too long".into()));
    }

    let mut message = Vec::with_capacity(3 + username.len() + password.len());
    message.push(AUTH_SUBNEG_VERSION);
    message.push(username.len() as u8);
    message.extend_from_slice(username.as_bytes());
    message.push(password.len() as u8);
    message.extend_from_slice(password.as_bytes());

    stream.write_all(&message)?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status)?;

    if status[1] != 0 {
        return Err(BridgeError::UpstreamDial(
            "upstream rejected credentials".into(),
        ));
    }

    Ok(())
}

fn send_connect(
    stream: &mut TcpStream,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), BridgeError> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];

    match dest_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if dest_host.len() > 255 {
                return Err(BridgeError::UpstreamDial("destination host too long".into()));
            }
            request.push(ATYP_DOMAIN);
            request.push(dest_host.len() as u8);
            request.extend_from_slice(dest_host.as_bytes());
        }
    }

    request.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&request)?;

    Ok(())
}

fn read_reply(stream: &mut TcpStream) -> Result<(), BridgeError> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;

    if head[0] != SOCKS5_VERSION {
        return Err(BridgeError::UpstreamDial("malformed SOCKS5 reply".into()));
    }

    if head[1] != REP_SUCCESS {
        return Err(BridgeError::UpstreamDial(format!(
            "upstream refused connect: {}",
            reply_text(head[1])
        )));
    }

    // Drain the bound address so the stream starts at relay payload.
    match head[3] {
        ATYP_IPV4 => drain(stream, 4 + 2),
        ATYP_IPV6 => drain(stream, 16 + 2),
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            drain(stream, len[0] as usize + 2)
        }
        other => Err(BridgeError::UpstreamDial(format!(
            "unknown address type {} in reply",
            other
        ))),
    }
}

fn drain(stream: &mut TcpStream, n: usize) -> Result<(), BridgeError> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf)?;
    Ok(())
}

fn reply_text(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Upstream double that records the handshake and accepts the connect.
    fn upstream(expect_auth: bool) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();

            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            stream.read_exact(&mut methods).unwrap();

            if expect_auth {
                stream.write_all(&[0x05, 0x02]).unwrap();

                let mut head = [0u8; 2];
                stream.read_exact(&mut head).unwrap();
                let mut username = vec![0u8; head[1] as usize];
                stream.read_exact(&mut username).unwrap();
                let mut plen = [0u8; 1];
                stream.read_exact(&mut plen).unwrap();
                let mut password = vec![0u8; plen[0] as usize];
                stream.read_exact(&mut password).unwrap();

                seen.extend_from_slice(&username);
                seen.push(b':');
                seen.extend_from_slice(&password);

                stream.write_all(&[0x01, 0x00]).unwrap();
            } else {
                stream.write_all(&[0x05, 0x00]).unwrap();
            }

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).unwrap();
            assert_eq!(head[1], CMD_CONNECT);
            assert_eq!(head[3], ATYP_DOMAIN);

            let mut len = [0u8; 1];
            stream.read_exact(&mut len).unwrap();
            let mut dest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut dest).unwrap();

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();

            seen.extend_from_slice(&dest[..dest.len() - 2]);
            seen
        });

        (port, handle)
    }

    #[test]
    fn connects_with_domain_destination() {
        let (port, handle) = upstream(false);

        let stream = connect_via_socks(
            "127.0.0.1",
            port,
            "dest.example.com",
            443,
            None,
            Duration::from_secs(5),
        );
        assert!(stream.is_ok());

        let seen = handle.join().unwrap();
        assert_eq!(seen, b"dest.example.com");
    }

    #[test]
    fn passes_isolation_credentials_through() {
        let (port, handle) = upstream(true);

        let stream = connect_via_socks(
            "127.0.0.1",
            port,
            "dest.example.com",
            80,
            Some(("isolate-me", "secret")),
            Duration::from_secs(5),
        );
        assert!(stream.is_ok());

        let seen = handle.join().unwrap();
        assert!(seen.starts_with(b"isolate-me:secret"));
    }

    #[test]
    fn refused_connect_is_an_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            stream.read_exact(&mut methods).unwrap();
            stream.write_all(&[0x05, 0x00]).unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).unwrap();
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).unwrap();
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).unwrap();

            // Connection refused.
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
        });

        let result = connect_via_socks(
            "127.0.0.1",
            port,
            "dest.example.com",
            80,
            None,
            Duration::from_secs(5),
        );

        match result {
            Err(BridgeError::UpstreamDial(msg)) => assert!(msg.contains("refused")),
            other => panic!("expected upstream error, got {:?}", other.map(|_| ())),
        }
    }
}
