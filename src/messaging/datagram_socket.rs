use std::fmt::{Debug, Formatter};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

/// upper bound for how long a blocked `recv_from` takes to notice `abort()`
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,
    #[error("address in use")]
    AddressInUse,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("socket aborted")]
    Aborted,
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
}
impl SocketError {
    pub fn code(&self) -> u32 {
        match self {
            SocketError::WouldBlock => 0x80410123,
            SocketError::AddressInUse => 0x80410130,
            SocketError::HostUnreachable => 0x80410141,
            SocketError::Aborted => 0x80410104,
            SocketError::Io(_) => 0x80410105,
        }
    }
}
impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SocketError::WouldBlock,
            io::ErrorKind::AddrInUse => SocketError::AddressInUse,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => SocketError::HostUnreachable,
            kind => SocketError::Io(kind),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub broadcast: bool,
}

/// The datagram socket a session sends and receives on. Implementations must allow `send_to`
///  from one thread while another is blocked in `recv_from`.
#[cfg_attr(test, mockall::automock)]
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], to: SocketAddrV4) -> Result<usize, SocketError>;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), SocketError>;

    /// unblocks a pending `recv_from`; every subsequent `recv_from` fails with
    ///  [SocketError::Aborted]
    fn abort(&self);
}

#[cfg_attr(test, mockall::automock)]
pub trait SocketProvider: Send + Sync {
    fn bind(&self, addr: SocketAddrV4, options: SocketOptions) -> Result<Arc<dyn DatagramSocket>, SocketError>;

    /// this host's address on the ad-hoc network
    fn local_ipv4(&self) -> Ipv4Addr;
}


pub struct UdpDatagramSocket {
    socket: UdpSocket,
    is_aborted: AtomicBool,
}
impl Debug for UdpDatagramSocket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpDatagramSocket{{{:?}}}", self.local_addr())
    }
}

impl UdpDatagramSocket {
    pub fn local_addr(&self) -> Result<SocketAddrV4, SocketError> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(SocketError::Io(io::ErrorKind::Unsupported)),
        }
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddrV4) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, to)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), SocketError> {
        loop {
            if self.is_aborted.load(Ordering::Acquire) {
                return Err(SocketError::Aborted);
            }

            match self.socket.recv_from(buf) {
                Ok((len, SocketAddr::V4(from))) => return Ok((len, from)),
                Ok((_, from)) => {
                    debug!("received datagram from non-IPv4 address {:?} - ignoring", from);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn abort(&self) {
        self.is_aborted.store(true, Ordering::Release);
    }
}


/// Binds real UDP sockets through `socket2` so that SO_REUSEADDR can be set before binding.
#[derive(Debug, Default)]
pub struct UdpSocketProvider {}

impl UdpSocketProvider {
    fn bind_udp(&self, addr: SocketAddrV4, options: SocketOptions) -> Result<UdpDatagramSocket, SocketError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        if options.broadcast {
            socket.set_broadcast(true)?;
        }
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let socket = UdpDatagramSocket {
            socket: socket.into(),
            is_aborted: AtomicBool::new(false),
        };
        trace!("bound {:?} with {:?}", socket, options);
        Ok(socket)
    }
}

impl SocketProvider for UdpSocketProvider {
    fn bind(&self, addr: SocketAddrV4, options: SocketOptions) -> Result<Arc<dyn DatagramSocket>, SocketError> {
        Ok(Arc::new(self.bind_udp(addr, options)?))
    }

    fn local_ipv4(&self) -> Ipv4Addr {
        // connecting a UDP socket sends nothing, it only selects the outbound interface
        let probe = || -> io::Result<SocketAddr> {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        };

        match probe() {
            Ok(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => *addr.ip(),
            other => {
                debug!("could not determine local IPv4 address ({:?}) - using loopback", other);
                Ipv4Addr::LOCALHOST
            }
        }
    }
}
