use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::trace;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Socket timeout while relaying; a connection silent past this is torn
/// down, which is the only cancellation mechanism a relay has.
pub const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Relay bytes both ways until either peer closes or errors, then tear both
/// sockets down. Each direction keeps exactly one in-flight buffer: a chunk
/// is fully written to the peer before the next read is issued, bounding
/// memory per connection.
pub fn relay_duplex(client: TcpStream, upstream: TcpStream) -> std::io::Result<()> {
    client.set_read_timeout(Some(RELAY_IDLE_TIMEOUT))?;
    upstream.set_read_timeout(Some(RELAY_IDLE_TIMEOUT))?;

    let client_to_upstream = (client.try_clone()?, upstream.try_clone()?);
    let upstream_to_client = (upstream, client);

    let forward = thread::Builder::new()
        .name("relay-up".into())
        .spawn(move || pump(client_to_upstream.0, client_to_upstream.1))?;

    pump(upstream_to_client.0, upstream_to_client.1);

    let _ = forward.join();

    Ok(())
}

/// Copy one direction. EOF propagates as a write-side shutdown so the peer
/// sees a clean close; any error drops both sides.
fn pump(mut src: TcpStream, mut dst: TcpStream) {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match src.read(&mut buffer) {
            Ok(0) => {
                let _ = dst.shutdown(Shutdown::Write);
                break;
            }
            Ok(n) => n,
            Err(_) => {
                let _ = dst.shutdown(Shutdown::Both);
                let _ = src.shutdown(Shutdown::Both);
                break;
            }
        };

        if dst.write_all(&buffer[..n]).and_then(|_| dst.flush()).is_err() {
            let _ = src.shutdown(Shutdown::Both);
            break;
        }

        trace!(bytes = n, "relayed chunk");
    }
}
