//! Fakes and packet builders for testing sessions without real sockets.

pub mod tracking_socket;

pub use tracking_socket::{TrackingSocket, TrackingSocketProvider};

use crate::messaging::matching_messages::{MatchingMessage, OptMessage, PacketType};

/// the serialized form of an opt-shaped packet
pub fn opt_packet(packet_type: PacketType, opt: &[u8], peer_id: Option<u32>) -> Vec<u8> {
    MatchingMessage::Opt(OptMessage {
        packet_type,
        opt: opt.to_vec(),
        peer_id,
    }).to_bytes().to_vec()
}
