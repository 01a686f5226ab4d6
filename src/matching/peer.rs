use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::info;

use crate::messaging::matching_messages::PacketType;

/// Local handle of a peer, stable for the peer's lifetime and never reused within a session.
pub type PeerId = u64;

/// Ordered by negotiation progress: capacity checks count peers at `InProgress` or later.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PeerStatus {
    Cancelled = 1,
    /// the peer asked to be matched, we have not decided yet
    Negotiating = 2,
    /// both sides asked, waiting for the final acknowledgement
    InProgress = 3,
    /// we asked, waiting for the peer's answer
    InProgress2 = 4,
    Established = 5,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendDataStatus {
    Ready,
    Busy,
}

/// Which event kinds for this peer are currently queued for the event thread. At most one of
///  each kind may be outstanding.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PendingEvents {
    pub packet: bool,
    /// registration or keepalive timeout, they share one timer
    pub peer_timer: bool,
    pub data_timer: bool,
}
impl PendingEvents {
    pub fn any(&self) -> bool {
        self.packet || self.peer_timer || self.data_timer
    }
}

pub struct Peer {
    pub id: PeerId,
    pub addr: Ipv4Addr,
    pub status: PeerStatus,

    /// our id towards this peer, sent in the negotiation footer and in data packets; never 0
    pub target_count: u32,
    /// the peer's id for us, learned from its negotiation footer
    pub uid: u32,
    /// the packet type our pending request was sent with, retransmitted on registration timeout
    pub request_type: PacketType,

    pub registration_retries: u32,
    pub keepalive_retries: u32,
    pub data_retries: u32,

    /// interval hints from the peer's Hello
    pub hello_interval_hint: Option<Duration>,
    pub keepalive_interval_hint: Option<Duration>,
    /// the Hello flag: keep retransmitting our request regardless of the retry budget
    pub keep_retrying_registration: bool,

    /// the last received datagram, valid between receipt and processing
    pub raw_packet: Option<Vec<u8>>,
    /// opt data attached to our requests and cancellations
    pub opt: Vec<u8>,
    pub send_data: Vec<u8>,
    pub send_seq: u32,
    pub recv_seq: u32,
    pub send_data_status: SendDataStatus,

    pub pending: PendingEvents,
    /// set when the peer said bye; the peer is removed once no events for it are outstanding
    pub is_deleted: bool,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{#{} {} {:?} id:{} uid:{}}}", self.id, self.addr, self.status, self.target_count, self.uid)
    }
}

impl Peer {
    pub fn new(id: PeerId, addr: Ipv4Addr, initial_target_count: u32) -> Peer {
        Peer {
            id,
            addr,
            status: PeerStatus::Cancelled,
            target_count: initial_target_count.max(1),
            uid: 0,
            request_type: PacketType::HelloAck,
            registration_retries: 0,
            keepalive_retries: 0,
            data_retries: 0,
            hello_interval_hint: None,
            keepalive_interval_hint: None,
            keep_retrying_registration: false,
            raw_packet: None,
            opt: Vec::new(),
            send_data: Vec::new(),
            send_seq: 0,
            recv_seq: 0,
            send_data_status: SendDataStatus::Ready,
            pending: PendingEvents::default(),
            is_deleted: false,
        }
    }

    pub fn is_established(&self) -> bool {
        self.status == PeerStatus::Established
    }

    /// the id used for a new request, skipping 0 on wrap-around
    pub fn next_target_count(&mut self) -> u32 {
        self.target_count = match self.target_count.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        self.target_count
    }

    /// Changes the status and returns `true` if the roster must be rebuilt, i.e. the peer moved into
    ///  or out of `Established`.
    pub fn set_status(&mut self, status: PeerStatus) -> bool {
        let old = self.status;
        if old == status {
            return false;
        }
        info!("peer {}: {:?} -> {:?}", self.addr, old, status);
        self.status = status;

        if matches!(old, PeerStatus::InProgress | PeerStatus::InProgress2) {
            self.opt.clear();
        }
        if status == PeerStatus::Established {
            self.send_seq = 0;
            self.recv_seq = 0;
        }
        if old == PeerStatus::Established {
            self.send_data_status = SendDataStatus::Ready;
        }

        old == PeerStatus::Established || status == PeerStatus::Established
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn peer() -> Peer {
        Peer::new(1, Ipv4Addr::new(10, 0, 0, 2), 5)
    }

    #[test]
    fn test_new_peer() {
        let p = peer();
        assert_eq!(p.status, PeerStatus::Cancelled);
        assert_eq!(p.target_count, 5);
        assert_eq!(p.send_data_status, SendDataStatus::Ready);
        assert!(!p.pending.any());

        assert_eq!(Peer::new(1, Ipv4Addr::LOCALHOST, 0).target_count, 1);
    }

    #[test]
    fn test_next_target_count_skips_zero() {
        let mut p = Peer::new(1, Ipv4Addr::LOCALHOST, u32::MAX);
        assert_eq!(p.next_target_count(), 1);
        assert_eq!(p.next_target_count(), 2);
    }

    #[test]
    fn test_status_order() {
        assert!(PeerStatus::Cancelled < PeerStatus::Negotiating);
        assert!(PeerStatus::Negotiating < PeerStatus::InProgress);
        assert!(PeerStatus::InProgress < PeerStatus::InProgress2);
        assert!(PeerStatus::InProgress2 < PeerStatus::Established);
    }

    #[rstest]
    #[case::into_established(PeerStatus::InProgress, PeerStatus::Established, true)]
    #[case::out_of_established(PeerStatus::Established, PeerStatus::Cancelled, true)]
    #[case::unchanged(PeerStatus::Established, PeerStatus::Established, false)]
    #[case::negotiation(PeerStatus::Cancelled, PeerStatus::InProgress2, false)]
    fn test_set_status_roster_change(#[case] from: PeerStatus, #[case] to: PeerStatus, #[case] expected: bool) {
        let mut p = peer();
        p.status = from;
        assert_eq!(p.set_status(to), expected);
        assert_eq!(p.status, to);
    }

    #[test]
    fn test_set_status_side_effects() {
        let mut p = peer();
        p.status = PeerStatus::InProgress2;
        p.opt = b"req".to_vec();
        p.send_seq = 4;
        p.recv_seq = 9;

        p.set_status(PeerStatus::Established);
        assert!(p.opt.is_empty());
        assert_eq!((p.send_seq, p.recv_seq), (0, 0));

        p.send_data_status = SendDataStatus::Busy;
        p.set_status(PeerStatus::Cancelled);
        assert_eq!(p.send_data_status, SendDataStatus::Ready);
    }
}
