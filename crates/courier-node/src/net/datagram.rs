//! # Datagram I/O
//!
//! A single non-blocking UDP socket shared by every bundle transfer.
//! The socket is set to a short receive timeout rather than truly
//! non-blocking mode so the reception thread can poll a shutdown flag
//! between reads without busy-spinning.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use courier_transport::wire::MAX_DATAGRAM;

const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct DatagramIo {
    socket: UdpSocket,
}

impl DatagramIo {
    /// Binds `0.0.0.0:<port>`, enabling address reuse and sizing the
    /// kernel send/receive buffers generously so a burst of chunks
    /// doesn't spill into drops before the reception thread drains it.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;
        Ok(DatagramIo {
            socket: socket.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Blocks up to the poll timeout waiting for a datagram. Returns
    /// `Ok(None)` on a read timeout so the caller can check a shutdown
    /// flag and loop again.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends one datagram. Refuses anything over `MAX_DATAGRAM` rather
    /// than letting the kernel silently fragment or reject it.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_DATAGRAM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds MAX_DATAGRAM", data.len()),
            ));
        }
        self.socket.send_to(data, dest)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(DatagramIo {
            socket: self.socket.try_clone()?,
        })
    }
}

/// Parses a `host:port` destination string as used by the CLI.
pub fn parse_destination(spec: &str) -> anyhow::Result<SocketAddr> {
    spec.parse()
        .or_else(|_| {
            use std::net::ToSocketAddrs;
            spec.to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
        })
        .map_err(|e| anyhow::anyhow!("invalid destination '{spec}': {e}"))
}
