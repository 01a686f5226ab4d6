use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::matching::matching_error::MatchingError;
use crate::util::buf_ext::BufExt;

pub const HEADER_MARKER: u8 = 1;
pub const HEADER_LEN: usize = 4;

/// `[peer id: u32][reserved: 12]`, appended to HelloAck and negotiation-ack beyond the declared
///  length
pub const NEGOTIATION_FOOTER_LEN: usize = 16;
/// `[flag: u8][reserved: 15]`, appended to Hello beyond the declared length
pub const HELLO_TRAILER_LEN: usize = 16;

const HELLO_FIXED_LEN: usize = 8;
const DATA_FIXED_LEN: usize = 8;
const ADDR_LEN: usize = 4;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    Abort = 0,
    Hello = 1,
    HelloAck = 2,
    NegotiationAck = 3,
    NegotiationAck2 = 4,
    Cancel = 5,
    MemberList = 6,
    MemberListAck = 7,
    Bye = 8,
    DataProbe = 9,
    Data = 10,
    DataAck = 11,
}
impl PacketType {
    pub fn has_negotiation_footer(self) -> bool {
        matches!(self, PacketType::HelloAck | PacketType::NegotiationAck)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub marker: u8,
    pub packet_type: PacketType,
    /// length of the body that follows the header, not counting trailers
    pub length: u16,
}
impl MessageHeader {
    pub fn new(packet_type: PacketType, length: usize) -> MessageHeader {
        debug_assert!(length <= u16::MAX as usize);
        MessageHeader {
            marker: HEADER_MARKER,
            packet_type,
            length: length as u16,
        }
    }

    /// the header the event thread sends to its own receiver to unblock it
    pub fn abort() -> MessageHeader {
        MessageHeader {
            marker: 0,
            packet_type: PacketType::Abort,
            length: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.marker);
        buf.put_u8(self.packet_type.into());
        buf.put_u16(self.length);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let marker = buf.try_get_u8_checked()?;
        let raw_type = buf.try_get_u8_checked()?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid packet type {}", raw_type))?;
        let length = buf.try_get_u16_be()?;

        Ok(MessageHeader {
            marker,
            packet_type,
            length,
        })
    }

    /// the number of bytes a datagram needs to hold the declared body
    pub fn declared_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HelloMessage {
    /// microseconds
    pub hello_interval: u32,
    /// microseconds, the keepalive interval a child should use towards the sender
    pub keepalive_interval: u32,
    pub opt: Vec<u8>,
    /// carried in the trailer; `None` if the trailer is absent
    pub flag: Option<bool>,
}
impl Debug for HelloMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hello{{interval:{}us, keepalive:{}us, opt:{}b, flag:{:?}}}", self.hello_interval, self.keepalive_interval, self.opt.len(), self.flag)
    }
}

/// The shape shared by all negotiation and control packets: an opaque opt payload, optionally
///  followed by the negotiation footer.
#[derive(Clone, Eq, PartialEq)]
pub struct OptMessage {
    pub packet_type: PacketType,
    pub opt: Vec<u8>,
    pub peer_id: Option<u32>,
}
impl Debug for OptMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{opt:{}b, peer_id:{:?}}}", self.packet_type, self.opt.len(), self.peer_id)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct DataMessage {
    pub packet_type: PacketType,
    pub target_id: u32,
    pub sequence_id: u32,
    pub payload: Vec<u8>,
}
impl Debug for DataMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{target:{}, seq:{}, payload:{}b}}", self.packet_type, self.target_id, self.sequence_id, self.payload.len())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemberListMessage {
    pub parent: Ipv4Addr,
    pub members: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MatchingMessage {
    Hello(HelloMessage),
    Opt(OptMessage),
    Data(DataMessage),
    MemberList(MemberListMessage),
}

impl MatchingMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            MatchingMessage::Hello(_) => PacketType::Hello,
            MatchingMessage::Opt(m) => m.packet_type,
            MatchingMessage::Data(m) => m.packet_type,
            MatchingMessage::MemberList(_) => PacketType::MemberList,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            MatchingMessage::Hello(m) => Self::ser_hello(m, buf),
            MatchingMessage::Opt(m) => Self::ser_opt(m, buf),
            MatchingMessage::Data(m) => Self::ser_data(m, buf),
            MatchingMessage::MemberList(m) => Self::ser_member_list(m, buf),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf
    }

    fn ser_hello(msg: &HelloMessage, buf: &mut impl BufMut) {
        MessageHeader::new(PacketType::Hello, HELLO_FIXED_LEN + msg.opt.len()).ser(buf);
        buf.put_u32(msg.hello_interval);
        buf.put_u32(msg.keepalive_interval);
        buf.put_slice(&msg.opt);
        if let Some(flag) = msg.flag {
            buf.put_u8(flag.into());
            buf.put_bytes(0, HELLO_TRAILER_LEN - 1);
        }
    }

    fn ser_opt(msg: &OptMessage, buf: &mut impl BufMut) {
        MessageHeader::new(msg.packet_type, msg.opt.len()).ser(buf);
        buf.put_slice(&msg.opt);
        if let Some(peer_id) = msg.peer_id {
            buf.put_u32(peer_id);
            buf.put_bytes(0, NEGOTIATION_FOOTER_LEN - 4);
        }
    }

    fn ser_data(msg: &DataMessage, buf: &mut impl BufMut) {
        MessageHeader::new(msg.packet_type, DATA_FIXED_LEN + msg.payload.len()).ser(buf);
        buf.put_u32(msg.target_id);
        buf.put_u32(msg.sequence_id);
        buf.put_slice(&msg.payload);
    }

    fn ser_member_list(msg: &MemberListMessage, buf: &mut impl BufMut) {
        MessageHeader::new(PacketType::MemberList, ADDR_LEN * (1 + msg.members.len())).ser(buf);
        buf.put_u32(msg.parent.to_bits());
        for member in &msg.members {
            buf.put_u32(member.to_bits());
        }
    }

    /// Parses a complete datagram. Inconsistent or truncated datagrams are reported as
    ///  [MatchingError::MalformedPacket] and never panic.
    pub fn parse(buf: &[u8]) -> Result<MatchingMessage, MatchingError> {
        Self::try_deser(buf)
            .map_err(|e| MatchingError::MalformedPacket(e.to_string()))
    }

    fn try_deser(buf: &[u8]) -> anyhow::Result<MatchingMessage> {
        let mut buf = buf;
        let header = MessageHeader::try_deser(&mut buf)?;
        if header.marker != HEADER_MARKER {
            return Err(anyhow!("invalid header marker {}", header.marker));
        }
        if buf.remaining() < header.length as usize {
            return Err(anyhow!("declared length {} exceeds available {} bytes", header.length, buf.remaining()));
        }

        // split into the declared body and whatever follows it
        let (body, trailer) = buf.split_at(header.length as usize);

        match header.packet_type {
            PacketType::Hello => Self::deser_hello(body, trailer),
            PacketType::Data | PacketType::DataAck => Self::deser_data(header.packet_type, body),
            // a probe carries the data shape when it acknowledges data, and is empty when sent
            //  during negotiation
            PacketType::DataProbe if body.len() >= DATA_FIXED_LEN => Self::deser_data(header.packet_type, body),
            PacketType::MemberList => Self::deser_member_list(body),
            packet_type => Self::deser_opt(packet_type, body, trailer),
        }
    }

    fn deser_hello(mut body: &[u8], mut trailer: &[u8]) -> anyhow::Result<MatchingMessage> {
        let hello_interval = body.try_get_u32_be()?;
        let keepalive_interval = body.try_get_u32_be()?;
        let opt = body.to_vec();

        let flag = if trailer.len() >= HELLO_TRAILER_LEN {
            Some(trailer.try_get_u8_checked()? != 0)
        }
        else {
            None
        };

        Ok(MatchingMessage::Hello(HelloMessage {
            hello_interval,
            keepalive_interval,
            opt,
            flag,
        }))
    }

    fn deser_opt(packet_type: PacketType, body: &[u8], mut trailer: &[u8]) -> anyhow::Result<MatchingMessage> {
        let peer_id = if packet_type.has_negotiation_footer() && trailer.len() >= NEGOTIATION_FOOTER_LEN {
            Some(trailer.try_get_u32_be()?)
        }
        else {
            None
        };

        Ok(MatchingMessage::Opt(OptMessage {
            packet_type,
            opt: body.to_vec(),
            peer_id,
        }))
    }

    fn deser_data(packet_type: PacketType, mut body: &[u8]) -> anyhow::Result<MatchingMessage> {
        let target_id = body.try_get_u32_be()?;
        let sequence_id = body.try_get_u32_be()?;

        Ok(MatchingMessage::Data(DataMessage {
            packet_type,
            target_id,
            sequence_id,
            payload: body.to_vec(),
        }))
    }

    fn deser_member_list(mut body: &[u8]) -> anyhow::Result<MatchingMessage> {
        if body.len() % ADDR_LEN != 0 {
            return Err(anyhow!("member list length {} is not a multiple of {}", body.len(), ADDR_LEN));
        }

        let parent = Ipv4Addr::from_bits(body.try_get_u32_be()?);
        let mut members = Vec::with_capacity(body.len() / ADDR_LEN);
        while body.has_remaining() {
            members.push(Ipv4Addr::from_bits(body.try_get_u32_be()?));
        }

        Ok(MatchingMessage::MemberList(MemberListMessage {
            parent,
            members,
        }))
    }
}


#[cfg(test)]
mod test {
    use rstest::*;

    use MatchingMessage::*;

    use super::*;

    fn opt(packet_type: PacketType, opt: &[u8], peer_id: Option<u32>) -> MatchingMessage {
        Opt(OptMessage { packet_type, opt: opt.to_vec(), peer_id })
    }

    fn data(packet_type: PacketType, target_id: u32, sequence_id: u32, payload: &[u8]) -> MatchingMessage {
        Data(DataMessage { packet_type, target_id, sequence_id, payload: payload.to_vec() })
    }

    #[rstest]
    #[case::hello(Hello(HelloMessage { hello_interval: 200_000, keepalive_interval: 20_000, opt: b"game".to_vec(), flag: Some(true) }))]
    #[case::hello_empty_no_trailer(Hello(HelloMessage { hello_interval: 1, keepalive_interval: 2, opt: vec![], flag: None }))]
    #[case::hello_ack(opt(PacketType::HelloAck, b"join", Some(7)))]
    #[case::hello_ack_empty(opt(PacketType::HelloAck, b"", Some(u32::MAX)))]
    #[case::negotiation_ack(opt(PacketType::NegotiationAck, b"x", Some(1)))]
    #[case::negotiation_ack2(opt(PacketType::NegotiationAck2, b"", None))]
    #[case::cancel(opt(PacketType::Cancel, b"go away", None))]
    #[case::member_list_ack(opt(PacketType::MemberListAck, b"", None))]
    #[case::bye(opt(PacketType::Bye, b"", None))]
    #[case::probe_empty(opt(PacketType::DataProbe, b"", None))]
    #[case::probe_with_ids(data(PacketType::DataProbe, 3, 4, b""))]
    #[case::data(data(PacketType::Data, 9, 1, b"ping"))]
    #[case::data_empty(data(PacketType::Data, 9, 0, b""))]
    #[case::data_ack(data(PacketType::DataAck, 9, 0, b""))]
    #[case::member_list(MemberList(MemberListMessage { parent: Ipv4Addr::new(10, 0, 0, 1), members: vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)] }))]
    #[case::member_list_parent_only(MemberList(MemberListMessage { parent: Ipv4Addr::new(10, 0, 0, 1), members: vec![] }))]
    fn test_ser_matching_message(#[case] msg: MatchingMessage) {
        let buf = msg.to_bytes();
        let deser_msg = MatchingMessage::parse(&buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[test]
    fn test_hello_ack_wire_layout() {
        let buf = opt(PacketType::HelloAck, b"ab", Some(0x01020304)).to_bytes();
        assert_eq!(&buf[..], &[
            1, 2, 0, 2,
            b'a', b'b',
            1, 2, 3, 4,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
    }

    #[test]
    fn test_hello_wire_layout() {
        let buf = Hello(HelloMessage { hello_interval: 0x100, keepalive_interval: 0x200, opt: vec![0xaa], flag: Some(true) }).to_bytes();
        let mut expected = vec![1, 1, 0, 9, 0, 0, 1, 0, 0, 0, 2, 0, 0xaa, 1];
        expected.extend_from_slice(&[0; 15]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_data_and_member_list_wire_layout() {
        let buf = data(PacketType::Data, 5, 6, b"p").to_bytes();
        assert_eq!(&buf[..], &[1, 10, 0, 9, 0, 0, 0, 5, 0, 0, 0, 6, b'p']);

        let buf = MemberList(MemberListMessage { parent: Ipv4Addr::new(1, 2, 3, 4), members: vec![Ipv4Addr::new(5, 6, 7, 8)] }).to_bytes();
        assert_eq!(&buf[..], &[1, 6, 0, 8, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_bye_and_abort_are_bare_headers() {
        assert_eq!(&opt(PacketType::Bye, b"", None).to_bytes()[..], &[1, 8, 0, 0]);

        let mut buf = BytesMut::new();
        MessageHeader::abort().ser(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![1, 2, 0])]
    #[case::bad_marker(vec![0, 8, 0, 0])]
    #[case::unknown_type(vec![1, 12, 0, 0])]
    #[case::declared_exceeds_buffer(vec![1, 5, 0, 3, 1, 2])]
    #[case::hello_too_short(vec![1, 1, 0, 4, 0, 0, 0, 1])]
    #[case::data_too_short(vec![1, 10, 0, 4, 0, 0, 0, 1])]
    #[case::member_list_not_aligned(vec![1, 6, 0, 6, 1, 2, 3, 4, 5, 6])]
    #[case::member_list_without_parent(vec![1, 6, 0, 0])]
    fn test_parse_malformed(#[case] raw: Vec<u8>) {
        match MatchingMessage::parse(&raw) {
            Err(MatchingError::MalformedPacket(_)) => {}
            other => panic!("expected MalformedPacket, was {:?}", other),
        }
    }

    #[test]
    fn test_short_footer_is_ignored() {
        let mut raw = opt(PacketType::NegotiationAck, b"o", Some(5)).to_bytes().to_vec();
        raw.truncate(raw.len() - 1);
        assert_eq!(MatchingMessage::parse(&raw).unwrap(), opt(PacketType::NegotiationAck, b"o", None));
    }

    #[test]
    fn test_footer_only_for_negotiation_types() {
        let mut raw = opt(PacketType::Cancel, b"", None).to_bytes().to_vec();
        raw.extend_from_slice(&[0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(MatchingMessage::parse(&raw).unwrap(), opt(PacketType::Cancel, b"", None));
    }
}
