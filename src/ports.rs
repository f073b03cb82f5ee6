use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use rand::Rng;

const PROBE_ATTEMPTS: u32 = 32;
const PROBE_BASE: u16 = 20_000;
const PROBE_SPAN: u16 = 20_000;

/// Pick a free loopback port by bind-probing random candidates, falling back
/// to `default` when nothing free turns up.
pub fn allocate_port(default: u16) -> u16 {
    let mut rng = rand::thread_rng();

    for _ in 0..PROBE_ATTEMPTS {
        let port = PROBE_BASE + rng.gen_range(0..PROBE_SPAN);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        if TcpListener::bind(addr).is_ok() {
            return port;
        }
    }

    default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_in_expected_range() {
        let port = allocate_port(29101);
        assert!(port == 29101 || (PROBE_BASE..PROBE_BASE + PROBE_SPAN).contains(&port));
    }
}
