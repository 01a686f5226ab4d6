//! The per-peer negotiation protocol as pure transitions: each handler mutates the [Peer] and
//!  returns the [Effect]s the session has to carry out (sending, timers, notifications).
//!  Handlers never fail on remote input; protocol violations become a `Cancel` reply and an
//!  `Error` notification.

use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::matching::matching_config::{duration_from_wire, MatchingMode};
use crate::matching::matching_error::MatchingError;
use crate::matching::matching_events::EventKind;
use crate::matching::peer::{Peer, PeerStatus, SendDataStatus};
use crate::messaging::matching_messages::{DataMessage, HelloMessage, MatchingMessage, MemberListMessage, OptMessage, PacketType};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Effect {
    Send(MatchingMessage),
    /// send the current roster to the peer
    SendRoster,
    /// (re)arm the peer timer to fire a registration timeout
    ArmRegistration,
    /// (re)arm the peer timer to fire a keepalive timeout
    ArmKeepalive,
    ArmData,
    /// cancel both the peer timer and the data timer
    DisarmAll,
    DisarmData,
    Notify(EventKind, Vec<u8>),
    /// the peer entered or left `Established`
    RebuildRoster,
    /// a child replaces its roster with the one its parent sent
    AdoptRoster(MemberListMessage),
}

/// Session-wide facts the transitions depend on.
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    pub mode: MatchingMode,
    pub own_addr: Ipv4Addr,
    pub max_peers: usize,
    /// peers other than the one being handled that are at `InProgress` or later
    pub others_in_progress: usize,
    pub retry_count: u32,
}
impl ProtocolContext {
    /// whether matching with `peer` would stay within `max_peers` (this node counts as one)
    pub fn has_room(&self, peer: &Peer) -> bool {
        let own = usize::from(peer.status >= PeerStatus::InProgress);
        self.others_in_progress + own + 1 < self.max_peers
    }

    /// Between two peer-to-peer nodes the one with the lower address owns the roster.
    pub fn owns_roster_towards(&self, peer: &Peer) -> bool {
        match self.mode {
            MatchingMode::Parent => true,
            MatchingMode::Child => false,
            MatchingMode::PeerToPeer => self.own_addr < peer.addr,
        }
    }
}

fn opt_message(peer: &Peer, packet_type: PacketType, opt: Vec<u8>) -> MatchingMessage {
    MatchingMessage::Opt(OptMessage {
        packet_type,
        opt,
        peer_id: packet_type.has_negotiation_footer().then_some(peer.target_count),
    })
}

fn reply(peer: &Peer, packet_type: PacketType) -> Effect {
    Effect::Send(opt_message(peer, packet_type, Vec::new()))
}

fn cancel_reply(peer: &Peer) -> Effect {
    Effect::Send(opt_message(peer, PacketType::Cancel, peer.opt.clone()))
}

fn request(peer: &Peer) -> Effect {
    Effect::Send(opt_message(peer, peer.request_type, peer.opt.clone()))
}

fn data_message(peer: &Peer) -> MatchingMessage {
    MatchingMessage::Data(DataMessage {
        packet_type: PacketType::Data,
        target_id: peer.target_count,
        sequence_id: peer.send_seq,
        payload: peer.send_data.clone(),
    })
}

fn data_ack(peer: &Peer) -> MatchingMessage {
    MatchingMessage::Data(DataMessage {
        packet_type: PacketType::DataAck,
        target_id: peer.target_count,
        sequence_id: peer.recv_seq.wrapping_sub(1),
        payload: Vec::new(),
    })
}

/// Collects the effects of one transition.
struct Transition<'a> {
    peer: &'a mut Peer,
    effects: Vec<Effect>,
}
impl<'a> Transition<'a> {
    fn new(peer: &'a mut Peer) -> Transition<'a> {
        Transition { peer, effects: Vec::new() }
    }

    fn set_status(&mut self, status: PeerStatus) {
        if self.peer.set_status(status) {
            self.effects.push(Effect::RebuildRoster);
        }
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn notify(&mut self, kind: EventKind, opt: Vec<u8>) {
        self.effects.push(Effect::Notify(kind, opt));
    }

    /// drop the peer back to `Cancelled`, stopping all its timers
    fn cancel(&mut self) {
        self.set_status(PeerStatus::Cancelled);
        self.push(Effect::DisarmAll);
    }

    /// the peer violated the protocol
    fn reject(&mut self) {
        debug!("protocol violation by {:?}", self.peer);
        self.cancel();
        self.push(cancel_reply(self.peer));
        self.notify(EventKind::Error, Vec::new());
    }

    fn establish(&mut self, retry_count: u32) {
        self.set_status(PeerStatus::Established);
        self.peer.keepalive_retries = retry_count;
        self.push(Effect::ArmKeepalive);
    }

    fn learn_uid(&mut self, peer_id: Option<u32>) {
        if let Some(uid) = peer_id {
            self.peer.uid = uid;
        }
    }

    fn done(self) -> Vec<Effect> {
        self.effects
    }
}


/// Handles a packet received from `peer`.
pub fn on_packet(peer: &mut Peer, ctx: &ProtocolContext, msg: &MatchingMessage) -> Vec<Effect> {
    let packet_type = msg.packet_type();
    if !accepts_packet_type(peer, ctx, packet_type) {
        trace!("ignoring {:?} from {} in {:?} mode", packet_type, peer.addr, ctx.mode);
        return Vec::new();
    }

    let mut t = Transition::new(peer);
    check_renegotiation(&mut t, msg);

    match msg {
        MatchingMessage::Hello(m) => on_hello(&mut t, ctx, m),
        MatchingMessage::MemberList(m) => on_member_list(&mut t, ctx, m),
        // a probe may carry ids, its body does not matter
        MatchingMessage::Data(m) if m.packet_type == PacketType::DataProbe => on_data_probe(&mut t, ctx),
        MatchingMessage::Data(m) => on_data(&mut t, m),
        MatchingMessage::Opt(m) => match m.packet_type {
            PacketType::HelloAck => on_hello_ack(&mut t, ctx, m),
            PacketType::NegotiationAck => on_negotiation_ack(&mut t, ctx, m),
            PacketType::NegotiationAck2 => on_negotiation_ack2(&mut t, ctx),
            PacketType::Cancel => on_cancel(&mut t, m),
            PacketType::MemberListAck => on_member_list_ack(&mut t, ctx),
            PacketType::Bye => on_bye(&mut t),
            PacketType::DataProbe => on_data_probe(&mut t, ctx),
            other => trace!("ignoring {:?} without payload from {}", other, t.peer.addr),
        },
    }
    t.done()
}

fn accepts_packet_type(peer: &Peer, ctx: &ProtocolContext, packet_type: PacketType) -> bool {
    match (ctx.mode, packet_type) {
        (MatchingMode::Parent, PacketType::Hello | PacketType::MemberList) => false,
        (MatchingMode::Child, PacketType::HelloAck | PacketType::MemberListAck) => false,
        // only the roster owner sends member lists, and only the other side acknowledges them
        (MatchingMode::PeerToPeer, PacketType::MemberList) => !ctx.owns_roster_towards(peer),
        (MatchingMode::PeerToPeer, PacketType::MemberListAck) => ctx.owns_roster_towards(peer),
        _ => true,
    }
}

/// A negotiation packet carrying an id different from the one we know means the peer restarted
///  its negotiation, which invalidates any progress made with the old one.
fn check_renegotiation(t: &mut Transition, msg: &MatchingMessage) {
    let MatchingMessage::Opt(OptMessage { packet_type, peer_id: Some(peer_id), .. }) = msg else {
        return;
    };
    if !packet_type.has_negotiation_footer() || *peer_id == t.peer.uid {
        return;
    }

    match t.peer.status {
        PeerStatus::Negotiating | PeerStatus::InProgress => {
            debug!("{} renegotiates with id {} (was {})", t.peer.addr, peer_id, t.peer.uid);
            t.cancel();
            t.notify(EventKind::Cancel, Vec::new());
        }
        PeerStatus::Established => {
            debug!("established peer {} renegotiates with id {} (was {})", t.peer.addr, peer_id, t.peer.uid);
            t.cancel();
            t.notify(EventKind::Leave, Vec::new());
        }
        PeerStatus::Cancelled | PeerStatus::InProgress2 => {}
    }
}

fn on_hello(t: &mut Transition, ctx: &ProtocolContext, msg: &HelloMessage) {
    match t.peer.status {
        PeerStatus::Cancelled | PeerStatus::Negotiating => {
            t.peer.hello_interval_hint = Some(duration_from_wire(msg.hello_interval));
            t.peer.keepalive_interval_hint = Some(duration_from_wire(msg.keepalive_interval));
            if let Some(flag) = msg.flag {
                t.peer.keep_retrying_registration = flag;
            }
            if t.peer.status == PeerStatus::Cancelled && ctx.has_room(t.peer) {
                t.notify(EventKind::Hello, msg.opt.clone());
            }
        }
        PeerStatus::Established => {
            let ack = reply(t.peer, PacketType::NegotiationAck);
            t.push(ack);
        }
        PeerStatus::InProgress | PeerStatus::InProgress2 => {}
    }
}

fn on_hello_ack(t: &mut Transition, ctx: &ProtocolContext, msg: &OptMessage) {
    match t.peer.status {
        PeerStatus::Cancelled => {
            if ctx.has_room(t.peer) {
                t.set_status(PeerStatus::Negotiating);
                t.learn_uid(msg.peer_id);
                let probe = reply(t.peer, PacketType::DataProbe);
                t.push(probe);
                t.notify(EventKind::Request, msg.opt.clone());
            }
            else {
                let cancel = cancel_reply(t.peer);
                t.push(cancel);
            }
        }
        PeerStatus::Negotiating => {
            if ctx.has_room(t.peer) {
                let probe = reply(t.peer, PacketType::DataProbe);
                t.push(probe);
            }
            else {
                t.cancel();
                let cancel = cancel_reply(t.peer);
                t.push(cancel);
                t.notify(EventKind::Cancel, Vec::new());
            }
        }
        PeerStatus::InProgress => {
            let ack = opt_message(t.peer, PacketType::NegotiationAck, t.peer.opt.clone());
            t.push(Effect::Send(ack));
            t.push(Effect::ArmRegistration);
        }
        PeerStatus::InProgress2 => {
            // both sides asked at the same time
            let opt = t.peer.opt.clone();
            t.set_status(PeerStatus::InProgress);
            t.learn_uid(msg.peer_id);
            t.peer.registration_retries = ctx.retry_count;
            t.push(Effect::Send(opt_message(t.peer, PacketType::NegotiationAck, opt.clone())));
            t.peer.opt = opt;
            t.peer.request_type = PacketType::NegotiationAck;
            t.push(Effect::ArmRegistration);
            t.notify(EventKind::Accept, msg.opt.clone());
        }
        PeerStatus::Established => t.reject(),
    }
}

fn on_negotiation_ack(t: &mut Transition, ctx: &ProtocolContext, msg: &OptMessage) {
    match t.peer.status {
        PeerStatus::Cancelled => {
            let cancel = cancel_reply(t.peer);
            t.push(cancel);
        }
        PeerStatus::Negotiating | PeerStatus::InProgress => {
            t.learn_uid(msg.peer_id);
            t.establish(ctx.retry_count);
            let ack = reply(t.peer, PacketType::NegotiationAck2);
            t.push(ack);
            t.notify(EventKind::Established, Vec::new());
        }
        PeerStatus::InProgress2 => {
            t.learn_uid(msg.peer_id);
            t.establish(ctx.retry_count);
            let ack = reply(t.peer, PacketType::NegotiationAck2);
            t.push(ack);
            t.notify(EventKind::Accept, msg.opt.clone());
            t.notify(EventKind::Established, Vec::new());
        }
        PeerStatus::Established => {
            let ack = reply(t.peer, PacketType::NegotiationAck2);
            t.push(ack);
        }
    }
}

fn on_negotiation_ack2(t: &mut Transition, ctx: &ProtocolContext) {
    match t.peer.status {
        PeerStatus::Cancelled => {
            let cancel = cancel_reply(t.peer);
            t.push(cancel);
        }
        PeerStatus::Negotiating | PeerStatus::InProgress => t.reject(),
        PeerStatus::InProgress2 => {
            t.establish(ctx.retry_count);
            t.notify(EventKind::Established, Vec::new());
        }
        PeerStatus::Established => {}
    }
}

fn on_cancel(t: &mut Transition, msg: &OptMessage) {
    let kind = match t.peer.status {
        PeerStatus::Cancelled => return,
        PeerStatus::Negotiating | PeerStatus::InProgress => EventKind::Cancel,
        PeerStatus::InProgress2 => EventKind::Deny,
        PeerStatus::Established => EventKind::Leave,
    };
    t.cancel();
    t.notify(kind, msg.opt.clone());
}

fn on_member_list(t: &mut Transition, ctx: &ProtocolContext, msg: &MemberListMessage) {
    match t.peer.status {
        PeerStatus::Cancelled => {
            let cancel = cancel_reply(t.peer);
            t.push(cancel);
        }
        PeerStatus::Negotiating | PeerStatus::InProgress2 => t.reject(),
        PeerStatus::InProgress | PeerStatus::Established => {
            if t.peer.status == PeerStatus::InProgress {
                t.establish(ctx.retry_count);
                t.notify(EventKind::Established, Vec::new());
            }
            if ctx.mode == MatchingMode::Child {
                // after any rebuild caused by the status change, so the parent's view wins
                t.push(Effect::AdoptRoster(msg.clone()));
            }
            t.peer.keepalive_retries = ctx.retry_count;
            let ack = reply(t.peer, PacketType::MemberListAck);
            t.push(ack);
        }
    }
}

fn on_member_list_ack(t: &mut Transition, ctx: &ProtocolContext) {
    match t.peer.status {
        PeerStatus::Established => t.peer.keepalive_retries = ctx.retry_count,
        PeerStatus::Cancelled => {
            let cancel = cancel_reply(t.peer);
            t.push(cancel);
        }
        _ => t.reject(),
    }
}

fn on_bye(t: &mut Transition) {
    if t.peer.status != PeerStatus::Cancelled {
        t.cancel();
    }
    t.notify(EventKind::Bye, Vec::new());
    t.peer.is_deleted = true;
}

/// An empty probe keeps our outstanding request alive while the peer decides.
fn on_data_probe(t: &mut Transition, ctx: &ProtocolContext) {
    if t.peer.status == PeerStatus::InProgress2 {
        t.peer.registration_retries = ctx.retry_count;
    }
}

fn on_data(t: &mut Transition, msg: &DataMessage) {
    if t.peer.status != PeerStatus::Established {
        return;
    }
    if msg.target_id != t.peer.uid {
        debug!("data from {} for stale id {} (expected {}) - ignoring", t.peer.addr, msg.target_id, t.peer.uid);
        return;
    }

    match msg.packet_type {
        PacketType::Data => {
            if t.peer.recv_seq <= msg.sequence_id {
                t.peer.recv_seq = msg.sequence_id.wrapping_add(1);
                t.notify(EventKind::Data, msg.payload.clone());
            }
            else {
                trace!("duplicate data #{} from {}", msg.sequence_id, t.peer.addr);
            }
            let ack = data_ack(t.peer);
            t.push(Effect::Send(ack));
        }
        _ => {
            if t.peer.send_data_status == SendDataStatus::Busy && msg.sequence_id == t.peer.send_seq {
                t.peer.send_data_status = SendDataStatus::Ready;
                t.push(Effect::DisarmData);
                t.notify(EventKind::DataAck, Vec::new());
            }
        }
    }
}


/// The registration timer fired: retransmit our request or give up.
pub fn on_registration_timeout(peer: &mut Peer) -> Vec<Effect> {
    let mut t = Transition::new(peer);
    match t.peer.status {
        PeerStatus::InProgress | PeerStatus::InProgress2 => {
            let may_retry = t.peer.status == PeerStatus::InProgress2 && t.peer.keep_retrying_registration;
            if may_retry || t.peer.registration_retries > 0 {
                if !may_retry {
                    t.peer.registration_retries -= 1;
                }
                let req = request(t.peer);
                t.push(req);
                t.push(Effect::ArmRegistration);
            }
            else {
                debug!("registration with {} timed out", t.peer.addr);
                t.cancel();
                let cancel = cancel_reply(t.peer);
                t.push(cancel);
                t.notify(EventKind::Timeout, Vec::new());
            }
        }
        _ => {}
    }
    t.done()
}

/// The keepalive timer of an established peer fired.
pub fn on_keepalive_timeout(peer: &mut Peer, ctx: &ProtocolContext) -> Vec<Effect> {
    let mut t = Transition::new(peer);
    if t.peer.status != PeerStatus::Established {
        return t.done();
    }

    if ctx.owns_roster_towards(t.peer) {
        t.push(Effect::SendRoster);
    }
    if t.peer.keepalive_retries > 0 {
        t.peer.keepalive_retries -= 1;
        t.push(Effect::ArmKeepalive);
    }
    else {
        debug!("established peer {} timed out", t.peer.addr);
        t.cancel();
        let cancel = cancel_reply(t.peer);
        t.push(cancel);
        t.notify(EventKind::Timeout, Vec::new());
    }
    t.done()
}

/// No ack for our data arrived in time: resend, or report the loss once the budget is spent.
pub fn on_data_timeout(peer: &mut Peer) -> Vec<Effect> {
    let mut t = Transition::new(peer);
    if t.peer.send_data_status != SendDataStatus::Busy || t.peer.status != PeerStatus::Established {
        return t.done();
    }

    if t.peer.data_retries > 0 {
        t.peer.data_retries -= 1;
        let data = data_message(t.peer);
        t.push(Effect::Send(data));
        t.push(Effect::ArmData);
    }
    else {
        debug!("data to {} timed out", t.peer.addr);
        t.peer.send_data_status = SendDataStatus::Ready;
        t.notify(EventKind::DataTimeout, Vec::new());
    }
    t.done()
}


/// The local application asks to match with `peer`.
pub fn select(peer: &mut Peer, ctx: &ProtocolContext, opt: Vec<u8>) -> Result<Vec<Effect>, MatchingError> {
    let request_type = match peer.status {
        PeerStatus::Cancelled if ctx.mode == MatchingMode::Parent => return Err(MatchingError::TargetNotReady),
        PeerStatus::Cancelled => PacketType::HelloAck,
        PeerStatus::Negotiating => PacketType::NegotiationAck,
        PeerStatus::InProgress | PeerStatus::InProgress2 => return Err(MatchingError::RequestInProgress),
        PeerStatus::Established => return Err(MatchingError::AlreadyEstablished),
    };
    if !ctx.has_room(peer) {
        return Err(MatchingError::ExceedMaxNum);
    }

    let mut t = Transition::new(peer);
    t.set_status(PeerStatus::InProgress2);
    t.peer.next_target_count();
    t.peer.opt = opt;
    t.peer.request_type = request_type;
    t.peer.registration_retries = ctx.retry_count;
    let req = request(t.peer);
    t.push(req);
    t.push(Effect::ArmRegistration);
    Ok(t.done())
}

/// The local application cancels a request, declines a peer or leaves an established match.
pub fn cancel(peer: &mut Peer, opt: Vec<u8>) -> Vec<Effect> {
    let mut t = Transition::new(peer);
    if t.peer.status == PeerStatus::Cancelled {
        return t.done();
    }
    t.cancel();
    t.peer.opt = opt;
    let cancel = cancel_reply(t.peer);
    t.push(cancel);
    t.done()
}

pub fn send_data(peer: &mut Peer, ctx: &ProtocolContext, data: Vec<u8>) -> Result<Vec<Effect>, MatchingError> {
    if peer.status != PeerStatus::Established {
        return Err(MatchingError::NotEstablished);
    }
    if peer.send_data_status == SendDataStatus::Busy {
        return Err(MatchingError::DataBusy);
    }

    peer.send_data = data;
    peer.send_seq = peer.send_seq.wrapping_add(1);
    peer.data_retries = ctx.retry_count;
    peer.send_data_status = SendDataStatus::Busy;
    Ok(vec![Effect::Send(data_message(peer)), Effect::ArmData])
}

pub fn abort_send_data(peer: &mut Peer) -> Vec<Effect> {
    if peer.send_data_status == SendDataStatus::Ready {
        return Vec::new();
    }
    peer.send_data_status = SendDataStatus::Ready;
    vec![Effect::DisarmData]
}
