use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::messaging::datagram_socket::{DatagramSocket, SocketError, SocketOptions, SocketProvider};
use crate::messaging::matching_messages::{MatchingMessage, PacketType};

/// Records every datagram sent through it, and hands out queued inbound datagrams.
#[derive(Debug)]
pub struct TrackingSocket {
    local: SocketAddrV4,
    sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    inbound: Mutex<VecDeque<(SocketAddrV4, Vec<u8>)>>,
    is_aborted: AtomicBool,
}

impl TrackingSocket {
    pub fn new(local: SocketAddrV4) -> TrackingSocket {
        TrackingSocket {
            local,
            sent: Default::default(),
            inbound: Default::default(),
            is_aborted: AtomicBool::new(false),
        }
    }

    pub fn push_inbound(&self, from: SocketAddrV4, datagram: Vec<u8>) {
        self.inbound.lock().unwrap().push_back((from, datagram));
    }

    pub fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// packet types of all datagrams sent so far, in order
    pub fn sent_types(&self) -> Vec<PacketType> {
        self.sent().iter()
            .filter_map(|(_, datagram)| PacketType::try_from(*datagram.get(1)?).ok())
            .collect()
    }

    /// packet types of the datagrams sent to `ip`, in order
    pub fn sent_to(&self, ip: Ipv4Addr) -> Vec<PacketType> {
        self.sent_messages_to(ip).iter()
            .map(|msg| msg.packet_type())
            .collect()
    }

    pub fn sent_messages_to(&self, ip: Ipv4Addr) -> Vec<MatchingMessage> {
        self.sent().iter()
            .filter(|(to, _)| *to.ip() == ip)
            .map(|(_, datagram)| MatchingMessage::parse(datagram).unwrap())
            .collect()
    }
}

impl DatagramSocket for TrackingSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddrV4) -> Result<usize, SocketError> {
        self.sent.lock().unwrap().push((to, buf.to_vec()));
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), SocketError> {
        loop {
            if self.is_aborted.load(Ordering::Acquire) {
                return Err(SocketError::Aborted);
            }
            if let Some((from, datagram)) = self.inbound.lock().unwrap().pop_front() {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                return Ok((len, from));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn abort(&self) {
        self.is_aborted.store(true, Ordering::Release);
    }
}


/// Hands out [TrackingSocket]s and remembers them by port.
#[derive(Debug)]
pub struct TrackingSocketProvider {
    local_ip: Ipv4Addr,
    sockets: Mutex<Vec<Arc<TrackingSocket>>>,
    busy_ports: Mutex<Vec<u16>>,
}

impl TrackingSocketProvider {
    pub fn new(local_ip: Ipv4Addr) -> TrackingSocketProvider {
        TrackingSocketProvider {
            local_ip,
            sockets: Default::default(),
            busy_ports: Default::default(),
        }
    }

    /// binding to `port` fails with [SocketError::AddressInUse]
    pub fn mark_busy(&self, port: u16) {
        self.busy_ports.lock().unwrap().push(port);
    }

    /// the most recently bound socket on `port`
    pub fn socket_on(&self, port: u16) -> Option<Arc<TrackingSocket>> {
        self.sockets.lock().unwrap().iter()
            .rev()
            .find(|s| s.local.port() == port)
            .cloned()
    }
}

impl SocketProvider for TrackingSocketProvider {
    fn bind(&self, addr: SocketAddrV4, _options: SocketOptions) -> Result<Arc<dyn DatagramSocket>, SocketError> {
        if self.busy_ports.lock().unwrap().contains(&addr.port()) {
            return Err(SocketError::AddressInUse);
        }
        let socket = Arc::new(TrackingSocket::new(addr));
        self.sockets.lock().unwrap().push(socket.clone());
        Ok(socket)
    }

    fn local_ipv4(&self) -> Ipv4Addr {
        self.local_ip
    }
}
