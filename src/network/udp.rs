//! UDP socket setup
//!
//! Sockets are created through socket2 so buffer sizes can be set before
//! binding, then handed out as plain `std::net::UdpSocket`s.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use crate::error::NetworkError;

/// Kernel buffer size requested for both directions
const SOCKET_BUFFER_BYTES: usize = 256 * 1024;

fn new_socket() -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Best effort; the kernel may clamp these
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES);
    Ok(socket)
}

/// Create the receive socket bound to `0.0.0.0:port`
pub fn bind_receive_socket(port: u16) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    new_socket()
        .and_then(|socket| {
            socket.bind(&addr.into())?;
            Ok(socket.into())
        })
        .map_err(|source| NetworkError::BindFailed { port, source })
}

/// Create the send socket on an ephemeral port
pub fn create_send_socket() -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    new_socket()
        .and_then(|socket| {
            socket.bind(&addr.into())?;
            Ok(socket.into())
        })
        .map_err(|source| NetworkError::BindFailed { port: 0, source })
}

/// Resolve the peer to an IPv4 socket address
pub fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::InvalidPeer(format!("{}:{}: {}", host, port, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetworkError::InvalidPeer(format!("{}:{}: no IPv4 address", host, port)))
}

/// Unblock a thread sitting in `recv_from` on `socket`.
///
/// Shuts the socket down, then sends it a zero-length datagram, since a
/// shutdown alone does not interrupt UDP receives on every platform.
pub fn wake_receiver(socket: &UdpSocket) {
    if let Err(e) = SockRef::from(socket).shutdown(Shutdown::Both) {
        tracing::trace!("Receive socket shutdown: {}", e);
    }

    let Ok(local) = socket.local_addr() else {
        return;
    };
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, local.port()));
    let waker = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
        .and_then(|waker| waker.send_to(&[], target));
    if let Err(e) = waker {
        tracing::debug!("Could not send wake datagram: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_conflict_reported() {
        let first = bind_receive_socket(0).unwrap();
        let port = first.local_addr().unwrap().port();

        match bind_receive_socket(port) {
            Err(NetworkError::BindFailed { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected bind failure, got {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[test]
    fn test_resolve_peer() {
        let addr = resolve_peer("127.0.0.1", 6000).unwrap();
        assert_eq!(addr, "127.0.0.1:6000".parse().unwrap());
    }
}
