//! Listening socket construction shared by both backends.

use std::io;
use std::net::SocketAddr;

/// Pending-connection backlog handed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Resolve the configured listen address.
pub fn parse_addr(listen: &str) -> io::Result<SocketAddr> {
    listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Create a non-blocking TCP listener bound to `addr`.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        let addr = parse_addr("0.0.0.0:1234").unwrap();
        assert_eq!(addr.port(), 1234);

        let err = parse_addr("not-an-address").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let first = create_listener(parse_addr("127.0.0.1:0").unwrap()).unwrap();
        let taken = first.local_addr().unwrap();

        assert!(create_listener(taken).is_err());
    }
}
