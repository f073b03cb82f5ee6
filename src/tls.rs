use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, RootCertStore, ServerName, StreamOwned};
use tracing::debug;

use crate::error::BridgeError;

/// Accepts whatever certificate the delegate presents. The bridge talks to
/// origins the user explicitly admitted and tunnels them anonymously; chain
/// validation happens, when it happens, through the fallback store.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Synchronous TLS dialer: permissive trust first, retried once against the
/// platform certificate store when the permissive handshake itself fails.
pub struct TlsDialer {
    permissive: Arc<ClientConfig>,
    native: Mutex<Option<Arc<ClientConfig>>>,
}

impl TlsDialer {
    pub fn new() -> Self {
        let permissive = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();

        Self {
            permissive: Arc::new(permissive),
            native: Mutex::new(None),
        }
    }

    /// Handshake over a fresh TCP connection from `dial`, falling back to a
    /// second dial against the native store when the first handshake fails.
    pub fn handshake_with_fallback(
        &self,
        host: &str,
        mut dial: impl FnMut() -> Result<TcpStream, BridgeError>,
    ) -> Result<TlsStream, BridgeError> {
        let tcp = dial()?;

        match self.handshake(Arc::clone(&self.permissive), host, tcp) {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(error = %e, "permissive handshake failed, retrying with installed certificates");

                let native = self.native_config()?;
                let tcp = dial()?;
                self.handshake(native, host, tcp)
            }
        }
    }

    fn handshake(
        &self,
        config: Arc<ClientConfig>,
        host: &str,
        mut tcp: TcpStream,
    ) -> Result<TlsStream, BridgeError> {
        let server_name = ServerName::try_from(host)
            .map_err(|e| BridgeError::UpstreamDial(format!("bad server name {}: {}", host, e)))?;

        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| BridgeError::UpstreamDial(format!("tls setup: {}", e)))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|e| BridgeError::UpstreamDial(format!("tls handshake: {}", e)))?;
        }

        Ok(StreamOwned::new(conn, tcp))
    }

    fn native_config(&self) -> Result<Arc<ClientConfig>, BridgeError> {
        let mut cached = self.native.lock().unwrap();

        if let Some(config) = cached.as_ref() {
            return Ok(Arc::clone(config));
        }

        let mut root_store = RootCertStore::empty();

        let native_certs = rustls_native_certs::load_native_certs()
            .map_err(|e| BridgeError::UpstreamDial(format!("native certs: {}", e)))?;
        for cert in native_certs {
            let _ = root_store.add(&Certificate(cert.0));
        }

        let config = Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );

        *cached = Some(Arc::clone(&config));
        Ok(config)
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

/// A delegate connection that may or may not be TLS-wrapped, so request
/// processing reads and writes one stream type.
pub enum DelegateStream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl DelegateStream {
    /// Clone of the underlying transport for out-of-band shutdown.
    pub fn tcp_handle(&self) -> std::io::Result<TcpStream> {
        match self {
            DelegateStream::Plain(tcp) => tcp.try_clone(),
            DelegateStream::Tls(tls) => tls.get_ref().try_clone(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, DelegateStream::Tls(_))
    }
}

impl Read for DelegateStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DelegateStream::Plain(tcp) => tcp.read(buf),
            DelegateStream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for DelegateStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DelegateStream::Plain(tcp) => tcp.write(buf),
            DelegateStream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            DelegateStream::Plain(tcp) => tcp.flush(),
            DelegateStream::Tls(tls) => tls.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn handshake_against_non_tls_peer_fails_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            // Answer the ClientHello with garbage.
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 256];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            }
        });

        let dialer = TlsDialer::new();
        let tcp = TcpStream::connect(addr).unwrap();
        let result = dialer.handshake(Arc::clone(&dialer.permissive), "bogus.example", tcp);

        assert!(matches!(result, Err(BridgeError::UpstreamDial(_))));
    }
}
