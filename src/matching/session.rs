use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::matching::matching_config::{duration_to_wire, MatchingMode, SessionConfig, MAX_BIND_ATTEMPTS, MAX_DATA_LEN, MAX_HELLO_OPT_LEN, MAX_OPT_LEN, MIN_RX_BUF_LEN};
use crate::matching::matching_error::MatchingError;
use crate::matching::matching_events::{Notification, NotificationHandler, NotificationQueue};
use crate::matching::peer::{Peer, PeerId, PeerStatus};
use crate::matching::peer_state_machine;
use crate::matching::peer_state_machine::{Effect, ProtocolContext};
use crate::matching::workers;
use crate::matching::workers::Workers;
use crate::messaging::datagram_socket::{DatagramSocket, SocketError, SocketOptions, SocketProvider, UdpSocketProvider};
use crate::messaging::matching_messages::{HelloMessage, MatchingMessage, MemberListMessage, MessageHeader, OptMessage, PacketType, HEADER_LEN, HEADER_MARKER};
use crate::util::random::{initial_peer_id, RngRandom};
use crate::util::timer_queue::TimerQueue;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionStatus {
    NotRunning,
    Stopping,
    Running,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TimerKey {
    Hello,
    /// registration or keepalive timer of a peer
    Peer(PeerId),
    Data(PeerId),
}

/// What the receiver and the timers hand to the event thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    Packet(PeerId),
    RegistrationTimeout(PeerId),
    KeepaliveTimeout(PeerId),
    HelloTimeout,
    DataTimeout(PeerId),
    Notification,
    Abort,
}

struct SessionState {
    status: SessionStatus,
    own_addr: Ipv4Addr,
    send_port: u16,
    send_socket: Option<Arc<dyn DatagramSocket>>,
    recv_socket: Option<Arc<dyn DatagramSocket>>,
    event_tx: Option<mpsc::Sender<SessionEvent>>,
    /// lent to the receiver thread while the session runs
    rx_buf: Vec<u8>,

    peers: BTreeMap<PeerId, Peer>,
    next_peer_id: PeerId,
    hello: Option<HelloMessage>,
    roster: Option<MemberListMessage>,
    notifications: NotificationQueue,
    hello_event_pending: bool,
    notification_event_pending: bool,
}

impl SessionState {
    fn find_peer(&self, addr: Ipv4Addr) -> Option<PeerId> {
        self.peers.values()
            .find(|p| p.addr == addr && !p.is_deleted)
            .map(|p| p.id)
    }

    /// number of peers at `InProgress` or later, not counting `except`
    fn count_in_progress(&self, except: Option<PeerId>) -> usize {
        self.peers.values()
            .filter(|p| Some(p.id) != except && p.status >= PeerStatus::InProgress)
            .count()
    }
}

/// Everything handed to the worker threads when a session starts.
pub(crate) struct SessionChannels {
    pub events: mpsc::Receiver<SessionEvent>,
    pub rx_buf: Vec<u8>,
    pub recv_socket: Arc<dyn DatagramSocket>,
}

/// The part of a session that is shared with its worker threads and timer callbacks.
pub(crate) struct SessionShared {
    pub config: SessionConfig,
    handler: Option<NotificationHandler>,
    provider: Arc<dyn SocketProvider>,
    peer_id_seed: fn() -> u32,
    pub timers: TimerQueue<TimerKey>,
    state: Mutex<SessionState>,
    me: Weak<SessionShared>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    fn context_for(&self, state: &SessionState, peer_id: PeerId) -> ProtocolContext {
        ProtocolContext {
            mode: self.config.mode,
            own_addr: state.own_addr,
            max_peers: self.config.max_peers,
            others_in_progress: state.count_in_progress(Some(peer_id)),
            retry_count: self.config.retry_count,
        }
    }

    /// datagrams for a peer on our own address go out as broadcast
    fn destination(&self, state: &SessionState, addr: Ipv4Addr) -> SocketAddrV4 {
        let ip = if addr == state.own_addr {
            self.config.broadcast_address
        }
        else {
            addr
        };
        SocketAddrV4::new(ip, self.config.port)
    }

    fn broadcast_destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.config.broadcast_address, self.config.port)
    }

    fn send(&self, state: &SessionState, to: SocketAddrV4, msg: &MatchingMessage) {
        trace!("sending {:?} to {}", msg, to);
        self.send_raw(state, to, &msg.to_bytes());
    }

    fn send_raw(&self, state: &SessionState, to: SocketAddrV4, buf: &[u8]) {
        let Some(socket) = &state.send_socket else {
            debug!("no send socket - dropping datagram to {}", to);
            return;
        };

        match socket.send_to(buf, to) {
            // retransmission timers take care of lost datagrams
            Ok(_) | Err(SocketError::WouldBlock) => {}
            Err(e) => warn!("sending datagram to {} failed: {}", to, e),
        }
    }

    /// Posts an event to the event thread, blocking while the channel is full.
    pub fn post_event(&self, event: SessionEvent) -> bool {
        let Some(tx) = self.lock().event_tx.clone() else {
            return false;
        };
        match tx.blocking_send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!("event channel closed - dropping {:?}", event);
                false
            }
        }
    }

    /// Called from timer callbacks: at most one event of each kind is in flight per peer.
    fn post_timer_event(&self, event: SessionEvent) {
        let tx = {
            let mut state = self.lock();
            if state.status != SessionStatus::Running {
                return;
            }

            let token = match event {
                SessionEvent::HelloTimeout => &mut state.hello_event_pending,
                SessionEvent::RegistrationTimeout(id) | SessionEvent::KeepaliveTimeout(id) => match state.peers.get_mut(&id) {
                    Some(peer) => &mut peer.pending.peer_timer,
                    None => return,
                },
                SessionEvent::DataTimeout(id) => match state.peers.get_mut(&id) {
                    Some(peer) => &mut peer.pending.data_timer,
                    None => return,
                },
                _ => return,
            };
            if *token {
                trace!("{:?} is already pending", event);
                return;
            }
            *token = true;
            state.event_tx.clone()
        };

        if let Some(tx) = tx {
            if tx.blocking_send(event).is_err() {
                debug!("event channel closed - dropping {:?}", event);
            }
        }
    }

    fn arm(&self, key: TimerKey, delay: Duration, event: SessionEvent) {
        self.timers.cancel(&key);
        let me = self.me.clone();
        let result = self.timers.schedule(key, delay, move || {
            if let Some(shared) = me.upgrade() {
                shared.post_timer_event(event);
            }
        });
        if let Err(e) = result {
            debug!("could not schedule {:?}: {}", key, e);
        }
    }

    fn disarm_peer(&self, peer_id: PeerId) {
        self.timers.cancel(&TimerKey::Peer(peer_id));
        self.timers.cancel(&TimerKey::Data(peer_id));
    }

    fn apply_effects(&self, state: &mut SessionState, peer_id: PeerId, effects: Vec<Effect>) {
        let Some(peer) = state.peers.get(&peer_id) else {
            return;
        };
        let addr = peer.addr;
        let keepalive_interval = match self.config.mode {
            MatchingMode::Child => peer.keepalive_interval_hint
                .filter(|d| !d.is_zero())
                .unwrap_or(self.config.keepalive_interval),
            _ => self.config.keepalive_interval,
        };
        let to = self.destination(state, addr);

        for effect in effects {
            match effect {
                Effect::Send(msg) => self.send(state, to, &msg),
                Effect::SendRoster => {
                    if let Some(roster) = &state.roster {
                        self.send(state, to, &MatchingMessage::MemberList(roster.clone()));
                    }
                }
                Effect::ArmRegistration => self.arm(TimerKey::Peer(peer_id), self.config.retransmit_interval, SessionEvent::RegistrationTimeout(peer_id)),
                Effect::ArmKeepalive => self.arm(TimerKey::Peer(peer_id), keepalive_interval, SessionEvent::KeepaliveTimeout(peer_id)),
                Effect::ArmData => self.arm(TimerKey::Data(peer_id), self.config.retransmit_interval, SessionEvent::DataTimeout(peer_id)),
                Effect::DisarmAll => self.disarm_peer(peer_id),
                Effect::DisarmData => {
                    self.timers.cancel(&TimerKey::Data(peer_id));
                }
                Effect::Notify(kind, opt) => {
                    state.notifications.push(kind, addr, opt);
                    self.request_notification_delivery(state);
                }
                Effect::RebuildRoster => Self::rebuild_roster(state),
                Effect::AdoptRoster(roster) => {
                    trace!("adopting roster {:?}", roster);
                    state.roster = Some(roster);
                }
            }
        }
    }

    fn rebuild_roster(state: &mut SessionState) {
        let members = state.peers.values()
            .filter(|p| p.is_established())
            .map(|p| p.addr)
            .collect();
        state.roster = Some(MemberListMessage {
            parent: state.own_addr,
            members,
        });
    }

    fn request_notification_delivery(&self, state: &mut SessionState) {
        if self.handler.is_none() || state.notification_event_pending {
            return;
        }
        let result = match &state.event_tx {
            Some(tx) => tx.try_send(SessionEvent::Notification),
            None => return,
        };
        match result {
            Ok(()) => state.notification_event_pending = true,
            // delivered by the event thread after its current event
            Err(TrySendError::Full(_)) => warn!("event channel is full - deferring notification delivery"),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn deliver_notifications(&self) {
        let Some(handler) = &self.handler else {
            return;
        };
        let notifications = {
            let mut state = self.lock();
            state.notification_event_pending = false;
            state.notifications.drain()
        };
        for notification in &notifications {
            handler(notification);
        }
    }

    /// Validates a received datagram and stores it on its peer. Returns the event to post to the
    ///  event thread, or `None` if the datagram was dropped.
    pub fn handle_incoming(&self, from: SocketAddrV4, datagram: &[u8]) -> Option<SessionEvent> {
        if datagram.len() < HEADER_LEN {
            debug!("dropping {} byte datagram from {}: too short", datagram.len(), from);
            return None;
        }
        let header = match MessageHeader::try_deser(&mut &datagram[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping datagram from {}: {}", from, e);
                return None;
            }
        };
        if header.marker != HEADER_MARKER {
            trace!("dropping datagram from {} with marker {}", from, header.marker);
            return None;
        }
        if header.declared_len() > datagram.len() {
            debug!("dropping {:?} from {}: declared length {} exceeds datagram length {}", header.packet_type, from, header.length, datagram.len());
            return None;
        }

        let mut state = self.lock();
        if state.status != SessionStatus::Running {
            return None;
        }
        if *from.ip() == state.own_addr && from.port() == state.send_port {
            trace!("dropping self-originated {:?}", header.packet_type);
            return None;
        }

        let addr = *from.ip();
        let peer_id = match state.find_peer(addr) {
            Some(id) => id,
            None => {
                if !self.is_first_contact(header.packet_type) {
                    debug!("dropping {:?} from unknown peer {}", header.packet_type, addr);
                    return None;
                }
                let id = state.next_peer_id;
                state.next_peer_id += 1;
                let peer = Peer::new(id, addr, (self.peer_id_seed)());
                debug!("new peer {:?}", peer);
                state.peers.insert(id, peer);
                id
            }
        };

        let peer = state.peers.get_mut(&peer_id)?;
        if peer.pending.packet {
            debug!("dropping {:?} from {}: previous packet not processed yet", header.packet_type, addr);
            return None;
        }
        peer.raw_packet = Some(datagram.to_vec());
        peer.pending.packet = true;
        Some(SessionEvent::Packet(peer_id))
    }

    fn is_first_contact(&self, packet_type: PacketType) -> bool {
        match self.config.mode {
            MatchingMode::Parent => packet_type == PacketType::HelloAck,
            MatchingMode::Child => packet_type == PacketType::Hello,
            MatchingMode::PeerToPeer => matches!(packet_type, PacketType::Hello | PacketType::HelloAck),
        }
    }

    /// Processes one event on the event thread. Returns `Break` when the event thread should exit.
    pub fn handle_event(&self, event: SessionEvent) -> ControlFlow<()> {
        trace!("handling {:?}", event);
        match event {
            SessionEvent::Abort => {
                self.wake_receiver();
                return ControlFlow::Break(());
            }
            SessionEvent::Notification => {
                self.deliver_notifications();
                return ControlFlow::Continue(());
            }
            _ => {}
        }

        let mut state = self.lock();
        let peer_id = match event {
            SessionEvent::HelloTimeout => {
                state.hello_event_pending = false;
                self.on_hello_timeout(&mut state);
                None
            }
            SessionEvent::Packet(id) => {
                self.on_packet_event(&mut state, id);
                Some(id)
            }
            SessionEvent::RegistrationTimeout(id) | SessionEvent::KeepaliveTimeout(id) | SessionEvent::DataTimeout(id) => {
                self.on_timeout_event(&mut state, event, id);
                Some(id)
            }
            SessionEvent::Notification | SessionEvent::Abort => None,
        };
        if let Some(id) = peer_id {
            self.remove_if_deleted(&mut state, id);
        }

        let undelivered = self.handler.is_some() && !state.notification_event_pending && !state.notifications.is_empty();
        drop(state);

        if undelivered {
            self.deliver_notifications();
        }
        ControlFlow::Continue(())
    }

    fn on_packet_event(&self, state: &mut SessionState, peer_id: PeerId) {
        let ctx = self.context_for(state, peer_id);
        let Some(peer) = state.peers.get_mut(&peer_id) else {
            return;
        };
        peer.pending.packet = false;
        let Some(raw) = peer.raw_packet.take() else {
            return;
        };

        let msg = match MatchingMessage::parse(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping packet from {}: {}", peer.addr, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", msg, peer);

        let effects = peer_state_machine::on_packet(peer, &ctx, &msg);
        self.apply_effects(state, peer_id, effects);
    }

    fn on_timeout_event(&self, state: &mut SessionState, event: SessionEvent, peer_id: PeerId) {
        let ctx = self.context_for(state, peer_id);
        let Some(peer) = state.peers.get_mut(&peer_id) else {
            return;
        };

        let effects = match event {
            SessionEvent::RegistrationTimeout(_) => {
                peer.pending.peer_timer = false;
                peer_state_machine::on_registration_timeout(peer)
            }
            SessionEvent::KeepaliveTimeout(_) => {
                peer.pending.peer_timer = false;
                peer_state_machine::on_keepalive_timeout(peer, &ctx)
            }
            _ => {
                peer.pending.data_timer = false;
                peer_state_machine::on_data_timeout(peer)
            }
        };
        self.apply_effects(state, peer_id, effects);
    }

    fn on_hello_timeout(&self, state: &mut SessionState) {
        if state.status != SessionStatus::Running {
            return;
        }
        let Some(hello) = &state.hello else {
            return;
        };

        if state.count_in_progress(None) + 1 < self.config.max_peers {
            self.send(state, self.broadcast_destination(), &MatchingMessage::Hello(hello.clone()));
        }
        self.arm(TimerKey::Hello, self.config.hello_interval, SessionEvent::HelloTimeout);
    }

    fn remove_if_deleted(&self, state: &mut SessionState, peer_id: PeerId) {
        let Some(peer) = state.peers.get(&peer_id) else {
            return;
        };
        if peer.is_deleted && !peer.pending.any() {
            self.disarm_peer(peer_id);
            if let Some(peer) = state.peers.remove(&peer_id) {
                debug!("removed {:?}", peer);
            }
        }
    }

    /// sends an abort header to our own receive port so a receiver blocked in `recv_from` returns
    fn wake_receiver(&self) {
        let state = self.lock();
        let mut buf = BytesMut::new();
        MessageHeader::abort().ser(&mut buf);

        let ip = if self.config.local_address.is_unspecified() {
            Ipv4Addr::LOCALHOST
        }
        else {
            self.config.local_address
        };
        self.send_raw(&state, SocketAddrV4::new(ip, self.config.port), &buf);
    }

    fn bind_send_socket(&self) -> Result<(Arc<dyn DatagramSocket>, u16), MatchingError> {
        let options = SocketOptions { reuse_address: false, broadcast: true };
        for offset in self.config.mode.send_port_offset()..=MAX_BIND_ATTEMPTS {
            let Some(port) = self.config.port.checked_add(offset) else {
                break;
            };
            match self.provider.bind(SocketAddrV4::new(self.config.local_address, port), options) {
                Ok(socket) => return Ok((socket, port)),
                Err(SocketError::AddressInUse) => debug!("send port {} is in use", port),
                Err(e) => return Err(e.into()),
            }
        }
        Err(SocketError::AddressInUse.into())
    }

    /// Acquires sockets and transitions to `Running`. Everything acquired so far is released
    ///  again if a step fails.
    pub fn open(&self, hello_opt: Option<&[u8]>) -> Result<SessionChannels, MatchingError> {
        if hello_opt.is_some_and(|opt| opt.len() > MAX_HELLO_OPT_LEN) {
            return Err(MatchingError::InvalidOptLen);
        }

        let mut state = self.lock();
        if state.status != SessionStatus::NotRunning {
            return Err(MatchingError::IsRunning);
        }
        if state.rx_buf.len() < self.config.rx_buf_len {
            state.rx_buf = alloc_rx_buf(self.config.rx_buf_len)?;
        }

        let (send_socket, send_port) = self.bind_send_socket()?;
        let recv_socket = self.provider.bind(
            SocketAddrV4::new(self.config.local_address, self.config.port),
            SocketOptions { reuse_address: true, broadcast: false },
        )?;

        let own_addr = if self.config.local_address.is_unspecified() {
            self.provider.local_ipv4()
        }
        else {
            self.config.local_address
        };

        let (tx, rx) = mpsc::channel(self.config.event_queue_len);

        self.timers.reset();
        state.own_addr = own_addr;
        state.send_port = send_port;
        state.send_socket = Some(send_socket);
        state.recv_socket = Some(recv_socket.clone());
        state.event_tx = Some(tx);
        state.peers.clear();
        Self::rebuild_roster(&mut state);
        state.hello_event_pending = false;
        state.notification_event_pending = false;
        state.hello = self.config.mode.sends_hello().then(|| HelloMessage {
            hello_interval: duration_to_wire(self.config.hello_interval),
            keepalive_interval: duration_to_wire(self.config.keepalive_interval),
            opt: hello_opt.unwrap_or_default().to_vec(),
            flag: Some(true),
        });
        state.status = SessionStatus::Running;
        let rx_buf = mem::take(&mut state.rx_buf);
        let sends_hello = state.hello.is_some();
        drop(state);

        if sends_hello {
            self.arm(TimerKey::Hello, Duration::ZERO, SessionEvent::HelloTimeout);
        }
        info!("{:?} session running on {}:{} (sending from port {})", self.config.mode, own_addr, self.config.port, send_port);

        Ok(SessionChannels {
            events: rx,
            rx_buf,
            recv_socket,
        })
    }

    pub fn abort_receiver(&self) {
        if let Some(socket) = &self.lock().recv_socket {
            socket.abort();
        }
    }

    /// Drops the hello message and all peers, announcing our departure with a single Bye.
    fn say_goodbye(&self) {
        let mut state = self.lock();
        state.hello = None;
        self.timers.cancel(&TimerKey::Hello);

        let bye = MatchingMessage::Opt(OptMessage {
            packet_type: PacketType::Bye,
            opt: Vec::new(),
            peer_id: None,
        });
        self.send(&state, self.broadcast_destination(), &bye);

        for peer_id in state.peers.keys() {
            self.disarm_peer(*peer_id);
        }
        debug!("deleting {} peers", state.peers.len());
        state.peers.clear();
        state.roster = None;
    }

    /// Releases all resources and transitions to `NotRunning`. `rx_buf` is the receive buffer
    ///  returned by the receiver thread, if it ran.
    pub fn close(&self, rx_buf: Option<Vec<u8>>) {
        let mut state = self.lock();
        state.send_socket = None;
        state.recv_socket = None;
        state.event_tx = None;
        state.hello = None;
        state.roster = None;
        state.peers.clear();
        state.hello_event_pending = false;
        state.notification_event_pending = false;
        if let Some(rx_buf) = rx_buf {
            state.rx_buf = rx_buf;
        }
        else if let Ok(rx_buf) = alloc_rx_buf(self.config.rx_buf_len) {
            state.rx_buf = rx_buf;
        }
        state.status = SessionStatus::NotRunning;
    }
}

fn alloc_rx_buf(len: usize) -> Result<Vec<u8>, MatchingError> {
    let mut rx_buf = Vec::new();
    rx_buf.try_reserve_exact(len.max(MIN_RX_BUF_LEN))
        .map_err(|_| MatchingError::NoSpace)?;
    rx_buf.resize(len.max(MIN_RX_BUF_LEN), 0);
    Ok(rx_buf)
}


/// One running instance of the matching protocol bound to a local port.
///
/// Client operations may be called from any thread, including from the notification handler.
///  [MatchingSession::stop] joins the worker threads and must not be called from the handler.
pub struct MatchingSession {
    shared: Arc<SessionShared>,
    workers: Mutex<Option<Workers>>,
}

impl Debug for MatchingSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MatchingSession{{{:?}@{}:{:?}}}", self.shared.config.mode, self.shared.config.port, self.shared.status())
    }
}

impl MatchingSession {
    /// A session over real UDP sockets.
    pub fn new(config: SessionConfig, handler: Option<NotificationHandler>) -> Result<MatchingSession, MatchingError> {
        Self::with_provider(config, handler, Arc::new(UdpSocketProvider::default()), initial_peer_id::<RngRandom>)
    }

    /// Validates the configuration and reserves the receive buffer.
    ///
    /// `peer_id_seed` provides the starting id for each new peer's negotiation counter.
    pub fn with_provider(config: SessionConfig, handler: Option<NotificationHandler>, provider: Arc<dyn SocketProvider>, peer_id_seed: fn() -> u32) -> Result<MatchingSession, MatchingError> {
        let config = config.validated()?;
        let rx_buf = alloc_rx_buf(config.rx_buf_len)?;

        let shared = Arc::new_cyclic(|me| SessionShared {
            config,
            handler,
            provider,
            peer_id_seed,
            timers: TimerQueue::new(),
            state: Mutex::new(SessionState {
                status: SessionStatus::NotRunning,
                own_addr: Ipv4Addr::UNSPECIFIED,
                send_port: 0,
                send_socket: None,
                recv_socket: None,
                event_tx: None,
                rx_buf,
                peers: BTreeMap::new(),
                next_peer_id: 1,
                hello: None,
                roster: None,
                notifications: NotificationQueue::default(),
                hello_event_pending: false,
                notification_event_pending: false,
            }),
            me: me.clone(),
        });

        Ok(MatchingSession {
            shared,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// This node's address on the ad-hoc network, known while the session runs.
    pub fn local_address(&self) -> Option<Ipv4Addr> {
        let state = self.shared.lock();
        (state.status == SessionStatus::Running).then_some(state.own_addr)
    }

    /// Binds the sockets, starts the worker threads and, for Parent and peer-to-peer sessions,
    ///  starts broadcasting Hello with `hello_opt` as its payload.
    pub fn start(&self, hello_opt: Option<&[u8]>) -> Result<(), MatchingError> {
        let channels = self.shared.open(hello_opt)?;
        match workers::spawn(&self.shared, channels) {
            Ok(workers) => {
                *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = Some(workers);
                Ok(())
            }
            Err(e) => {
                error!("starting worker threads failed: {}", e);
                self.shared.timers.shutdown();
                self.shared.close(None);
                Err(e)
            }
        }
    }

    /// Stops the worker threads, broadcasts Bye, drops all peers and releases the sockets.
    pub fn stop(&self) -> Result<(), MatchingError> {
        let tx = {
            let mut state = self.shared.lock();
            if state.status != SessionStatus::Running {
                return Err(MatchingError::NotRunning);
            }
            state.status = SessionStatus::Stopping;
            state.event_tx.clone()
        };
        info!("stopping {:?} session on port {}", self.shared.config.mode, self.shared.config.port);

        self.shared.timers.shutdown();
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner).take();
        let rx_buf = match workers {
            Some(workers) => workers.join(&self.shared, tx),
            None => None,
        };

        self.shared.say_goodbye();
        self.shared.close(rx_buf);
        info!("session on port {} stopped", self.shared.config.port);
        Ok(())
    }

    fn with_peer(&self, addr: Ipv4Addr, op: impl FnOnce(&mut Peer, &ProtocolContext) -> Result<Vec<Effect>, MatchingError>) -> Result<(), MatchingError> {
        let mut state = self.shared.lock();
        if state.status != SessionStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        let peer_id = state.find_peer(addr)
            .ok_or(MatchingError::UnknownTarget)?;

        let ctx = self.shared.context_for(&state, peer_id);
        let peer = state.peers.get_mut(&peer_id)
            .ok_or(MatchingError::UnknownTarget)?;
        let effects = op(peer, &ctx)?;
        self.shared.apply_effects(&mut state, peer_id, effects);
        Ok(())
    }

    /// Asks the peer at `addr` to match, or accepts its request.
    pub fn select_peer(&self, addr: Ipv4Addr, opt: &[u8]) -> Result<(), MatchingError> {
        if opt.len() > MAX_OPT_LEN {
            return Err(MatchingError::InvalidOptLen);
        }
        debug!("selecting {}", addr);
        self.with_peer(addr, |peer, ctx| peer_state_machine::select(peer, ctx, opt.to_vec()))
    }

    /// Withdraws a request, declines the peer or leaves an established match.
    pub fn cancel_peer(&self, addr: Ipv4Addr, opt: &[u8]) -> Result<(), MatchingError> {
        if opt.len() > MAX_OPT_LEN {
            return Err(MatchingError::InvalidOptLen);
        }
        debug!("cancelling {}", addr);
        self.with_peer(addr, |peer, _| Ok(peer_state_machine::cancel(peer, opt.to_vec())))
    }

    /// Sends `data` to an established peer. Completion is reported as a `DataAck` or
    ///  `DataTimeout` notification; only one send per peer may be outstanding.
    pub fn send_data(&self, addr: Ipv4Addr, data: &[u8]) -> Result<(), MatchingError> {
        if data.is_empty() || data.len() > MAX_DATA_LEN {
            return Err(MatchingError::InvalidDataLen);
        }
        self.with_peer(addr, |peer, ctx| peer_state_machine::send_data(peer, ctx, data.to_vec()))
    }

    pub fn abort_send_data(&self, addr: Ipv4Addr) -> Result<(), MatchingError> {
        self.with_peer(addr, |peer, _| Ok(peer_state_machine::abort_send_data(peer)))
    }

    /// `[parent, members...]` of the current roster, empty if there is none.
    pub fn members(&self) -> Vec<Ipv4Addr> {
        let state = self.shared.lock();
        match &state.roster {
            Some(roster) => std::iter::once(roster.parent)
                .chain(roster.members.iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    fn check_hello_access(&self, state: &SessionState) -> Result<(), MatchingError> {
        if state.status != SessionStatus::Running {
            return Err(MatchingError::NotRunning);
        }
        if !self.shared.config.mode.sends_hello() {
            return Err(MatchingError::InvalidMode);
        }
        Ok(())
    }

    pub fn hello_opt(&self) -> Result<Vec<u8>, MatchingError> {
        let state = self.shared.lock();
        self.check_hello_access(&state)?;
        Ok(state.hello.as_ref()
            .map(|h| h.opt.clone())
            .unwrap_or_default())
    }

    /// Replaces the payload of the Hello broadcasts. Peers seeing our Hello keep retrying their
    ///  requests to us until we answer.
    pub fn set_hello_opt(&self, opt: &[u8]) -> Result<(), MatchingError> {
        if opt.len() > MAX_HELLO_OPT_LEN {
            return Err(MatchingError::InvalidOptLen);
        }
        let mut state = self.shared.lock();
        self.check_hello_access(&state)?;
        if let Some(hello) = &mut state.hello {
            hello.opt = opt.to_vec();
            hello.flag = Some(true);
        }
        Ok(())
    }

    /// Takes all notifications that were not delivered to a handler yet.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.shared.lock().notifications.drain()
    }

    pub fn peer_status(&self, addr: Ipv4Addr) -> Option<PeerStatus> {
        let state = self.shared.lock();
        state.find_peer(addr)
            .and_then(|id| state.peers.get(&id))
            .map(|p| p.status)
    }

    pub fn peers(&self) -> Vec<(Ipv4Addr, PeerStatus)> {
        self.shared.lock().peers.values()
            .filter(|p| !p.is_deleted)
            .map(|p| (p.addr, p.status))
            .collect()
    }
}

impl Drop for MatchingSession {
    fn drop(&mut self) {
        if self.status() == SessionStatus::Running {
            if let Err(e) = self.stop() {
                debug!("stopping session on drop failed: {}", e);
            }
        }
    }
}
