//! Socket helpers for the listen/accept path
//!
//! Listener construction goes through socket2 so we control SO_REUSEADDR and
//! the blocking mode before the socket is exposed, and rejected or undrained
//! sockets are torn down with SO_LINGER=0 so the kernel discards any buffered
//! data instead of lingering in TIME_WAIT.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 128;

/// Open a non-blocking TCP listen socket bound to `addr` with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Hard-close a socket immediately, discarding buffered data.
pub fn fast_close(stream: TcpStream) {
    let sock = SockRef::from(&stream);
    if let Err(e) = sock.set_linger(Some(Duration::from_secs(0))) {
        tracing::warn!("unable to set socket linger to 0, close may stall in CLOSE_WAIT: {e}");
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    #[test]
    fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: accept with no pending connection must not block
        match listener.accept() {
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock),
            Ok(_) => panic!("unexpected connection"),
        }
    }

    #[test]
    fn test_bind_listener_reuse_address() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        drop(first);
        // Rebinding the same port right after close must succeed
        bind_listener(addr).unwrap();
    }

    #[test]
    fn test_fast_close_delivers_eof_or_reset() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut buf = [0u8; 16];
            // Either an EOF or a reset is acceptable; blocking forever is not
            let _ = stream.read(&mut buf);
        });

        let accepted = loop {
            match listener.accept() {
                Ok((s, _)) => break s,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        fast_close(accepted);
        client.join().unwrap();
    }
}
