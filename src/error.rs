use thiserror::Error;

/// Error taxonomy for the bridge.
///
/// Connection-scoped errors stay inside the owning connection; supervisor
/// errors surface through the session liveness flag and the log, never as
/// panics across component boundaries.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Daemon binary missing or unstartable. Fatal for the current attempt,
    /// retried only after the reconnect interval.
    #[error("daemon process error: {0}")]
    Process(String),

    /// Control-channel authentication failed (bad server hash, rejected
    /// AUTHENTICATE, missing cookie).
    #[error("control handshake failed: {0}")]
    Handshake(String),

    /// Malformed or unexpected control reply. Closes the session.
    #[error("control protocol violation: {0}")]
    Protocol(String),

    /// SOCKS or TLS connect to a real destination failed.
    #[error("upstream dial failed: {0}")]
    UpstreamDial(String),

    /// Connection or processor cap exceeded. New work is rejected.
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// Malformed chunked or compressed body. Aborts that request only.
    #[error("rewrite failed: {0}")]
    Rewrite(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Stable category label for log lines.
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Process(_) => "process",
            BridgeError::Handshake(_) => "handshake",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::UpstreamDial(_) => "upstream",
            BridgeError::Capacity(_) => "capacity",
            BridgeError::Rewrite(_) => "rewrite",
            BridgeError::Config(_) => "config",
            BridgeError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        assert_eq!(BridgeError::Capacity("socks connections").category(), "capacity");
        assert_eq!(
            BridgeError::Handshake("server hash mismatch".into()).category(),
            "handshake"
        );
    }
}
