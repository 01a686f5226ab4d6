use std::net::Ipv4Addr;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::matching::matching_error::MatchingError;

pub const MAX_PEERS: usize = 16;
pub const MAX_OPT_LEN: usize = 9196;
pub const MAX_DATA_LEN: usize = 9204;
pub const MAX_HELLO_OPT_LEN: usize = 1426;
/// port offsets tried for the send socket before giving up on `AddressInUse`
pub const MAX_BIND_ATTEMPTS: u16 = 20;
pub const MIN_RX_BUF_LEN: usize = 4;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MatchingMode {
    Parent = 1,
    Child = 2,
    PeerToPeer = 3,
}
impl MatchingMode {
    /// Parent and peer-to-peer sessions advertise themselves with periodic Hello broadcasts
    pub fn sends_hello(self) -> bool {
        matches!(self, MatchingMode::Parent | MatchingMode::PeerToPeer)
    }

    /// the first port offset tried when binding the send socket
    pub fn send_port_offset(self) -> u16 {
        match self {
            MatchingMode::Parent => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: MatchingMode,
    /// maximum number of peers including this node; only configurable for Parent sessions, other
    ///  modes always have 2 (themselves and the partner)
    pub max_peers: usize,
    pub port: u16,
    pub rx_buf_len: usize,

    pub hello_interval: Duration,
    pub keepalive_interval: Duration,
    pub retry_count: u32,
    /// registration and data-ack retransmission interval
    pub retransmit_interval: Duration,

    /// this node's address on the ad-hoc network; resolved through the socket provider when
    ///  unspecified
    pub local_address: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,

    /// capacity of the channel between the receiver / timer threads and the event thread
    pub event_queue_len: usize,
}

impl SessionConfig {
    pub fn new(mode: MatchingMode, port: u16) -> SessionConfig {
        SessionConfig {
            mode,
            max_peers: 2,
            port,
            rx_buf_len: 1436,
            hello_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(20),
            retry_count: 3,
            retransmit_interval: Duration::from_millis(50),
            local_address: Ipv4Addr::UNSPECIFIED,
            broadcast_address: Ipv4Addr::BROADCAST,
            event_queue_len: 64,
        }
    }

    /// Checks the configuration and returns it with `max_peers` normalized for the mode.
    pub fn validated(mut self) -> Result<SessionConfig, MatchingError> {
        if self.mode == MatchingMode::Parent {
            if !(2..=MAX_PEERS).contains(&self.max_peers) {
                return Err(MatchingError::InvalidMaxNum);
            }
        }
        else {
            self.max_peers = 2;
        }

        if self.port == 0 {
            return Err(MatchingError::InvalidPort);
        }
        if self.rx_buf_len < MIN_RX_BUF_LEN {
            return Err(MatchingError::RxBufTooShort);
        }
        if self.hello_interval.is_zero() || self.keepalive_interval.is_zero() || self.retransmit_interval.is_zero() {
            return Err(MatchingError::InvalidArgument);
        }
        if self.event_queue_len == 0 {
            return Err(MatchingError::InvalidArgument);
        }
        Ok(self)
    }
}

/// intervals travel as microseconds on the wire
pub fn duration_to_wire(d: Duration) -> u32 {
    d.as_micros().try_into().unwrap_or(u32::MAX)
}

pub fn duration_from_wire(micros: u32) -> Duration {
    Duration::from_micros(micros as u64)
}
