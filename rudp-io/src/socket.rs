//! Non-blocking UDP socket wrapper
//!
//! The engine drives a single socket from its service loop, so the socket is
//! always non-blocking; `WouldBlock` surfaces as `None` rather than as an
//! error, letting the loop distinguish "nothing to read" from real failures.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::trace;

/// Largest datagram the engine will ever read in one call
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Socket setup and transfer errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("address family not recognized")]
    InvalidAddress,
}

/// Non-blocking UDP datagram socket
pub struct DatagramSocket {
    inner: Socket,
    recv_buf: Box<[MaybeUninit<u8>; RECV_BUFFER_SIZE]>,
}

impl DatagramSocket {
    /// Create a socket bound to `addr`; use port 0 for an ephemeral port
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        trace!(addr = %addr, "bound datagram socket");
        Ok(DatagramSocket {
            inner: socket,
            recv_buf: Box::new([MaybeUninit::uninit(); RECV_BUFFER_SIZE]),
        })
    }

    /// Get the local address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Set the kernel send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the kernel receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Send one datagram to `target`
    ///
    /// Returns `None` when the socket is not ready to send; the caller
    /// retries on the next service pass.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<Option<usize>, SocketError> {
        match self.inner.send_to(buf, &target.into()) {
            Ok(sent) => Ok(Some(sent)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Receive one datagram if any is queued
    ///
    /// Returns the datagram bytes and source address, or `None` when nothing
    /// is waiting. Datagrams larger than the internal buffer are truncated
    /// by the kernel and will fail validation upstream.
    pub fn recv_from(&mut self) -> Result<Option<(Vec<u8>, SocketAddr)>, SocketError> {
        match self.inner.recv_from(&mut self.recv_buf[..]) {
            Ok((len, addr)) => {
                let addr = addr.as_socket().ok_or(SocketError::InvalidAddress)?;
                // The kernel initialized the first `len` bytes
                let data = self.recv_buf[..len]
                    .iter()
                    .map(|byte| unsafe { byte.assume_init() })
                    .collect();
                Ok(Some((data, addr)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_ephemeral() {
        let socket = DatagramSocket::bind(loopback()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_recv_empty_returns_none() {
        let mut socket = DatagramSocket::bind(loopback()).unwrap();
        assert!(socket.recv_from().unwrap().is_none());
    }

    #[test]
    fn test_send_and_receive() {
        let sender = DatagramSocket::bind(loopback()).unwrap();
        let mut receiver = DatagramSocket::bind(loopback()).unwrap();
        let target = receiver.local_addr().unwrap();

        sender.send_to(b"ping", target).unwrap();

        for _ in 0..50 {
            if let Some((data, from)) = receiver.recv_from().unwrap() {
                assert_eq!(data, b"ping");
                assert_eq!(from.port(), sender.local_addr().unwrap().port());
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("datagram never arrived");
    }

    #[test]
    fn test_buffer_sizes_settable() {
        let socket = DatagramSocket::bind(loopback()).unwrap();
        socket.set_send_buffer_size(262_144).unwrap();
        socket.set_recv_buffer_size(262_144).unwrap();
    }
}
