//! The three threads of a running session: the receiver reads datagrams, the event thread runs
//!  the protocol, and the timer thread fires due timers. Receiver and timers only post events, all
//!  protocol state is changed on the event thread or by client calls under the session lock.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::matching::matching_error::MatchingError;
use crate::matching::session::{SessionChannels, SessionEvent, SessionShared};
use crate::messaging::datagram_socket::{DatagramSocket, SocketError};

/// bounds for the timer thread's sleep between two runs of due timers
const MIN_TIMER_SLEEP: Duration = Duration::from_millis(1);
const MAX_TIMER_SLEEP: Duration = Duration::from_millis(50);

/// pause after an unexpected receive error before trying again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) struct Workers {
    timer: JoinHandle<()>,
    event: JoinHandle<()>,
    receiver: JoinHandle<Vec<u8>>,
}

fn spawn_named<T: Send + 'static>(name: String, f: impl FnOnce() -> T + Send + 'static) -> Result<JoinHandle<T>, MatchingError> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| {
            error!("spawning thread {} failed: {}", name, e);
            MatchingError::NoSpace
        })
}

fn join_quietly<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(result) => Some(result),
        Err(_) => {
            error!("{} thread panicked", name);
            None
        }
    }
}

/// Starts the worker threads. If one of them cannot be started, the ones already running are
///  stopped again before returning the error.
pub(crate) fn spawn(shared: &Arc<SessionShared>, channels: SessionChannels) -> Result<Workers, MatchingError> {
    let port = shared.config.port;
    let SessionChannels { events, rx_buf, recv_socket } = channels;

    let timer = spawn_named(format!("matching-timer-{}", port), {
        let shared = shared.clone();
        move || run_timer(shared)
    })?;

    let event = match spawn_named(format!("matching-event-{}", port), {
        let shared = shared.clone();
        move || run_event_loop(shared, events)
    }) {
        Ok(handle) => handle,
        Err(e) => {
            shared.timers.shutdown();
            join_quietly("timer", timer);
            return Err(e);
        }
    };

    let receiver = match spawn_named(format!("matching-recv-{}", port), {
        let shared = shared.clone();
        move || run_receiver(shared, recv_socket, rx_buf)
    }) {
        Ok(handle) => handle,
        Err(e) => {
            shared.timers.shutdown();
            join_quietly("timer", timer);
            shared.post_event(SessionEvent::Abort);
            join_quietly("event", event);
            return Err(e);
        }
    };

    Ok(Workers { timer, event, receiver })
}

impl Workers {
    /// Joins all threads, expecting the session to be `Stopping` and its timer queue shut down.
    ///  Returns the receive buffer lent to the receiver.
    pub(crate) fn join(self, shared: &SessionShared, events: Option<mpsc::Sender<SessionEvent>>) -> Option<Vec<u8>> {
        join_quietly("timer", self.timer);

        if let Some(events) = events {
            if events.blocking_send(SessionEvent::Abort).is_err() {
                debug!("event thread is already gone");
            }
        }
        join_quietly("event", self.event);

        shared.abort_receiver();
        join_quietly("receiver", self.receiver)
    }
}

fn run_timer(shared: Arc<SessionShared>) {
    debug!("timer thread started");
    while shared.timers.is_running() {
        let sleep = shared.timers.run_due()
            .unwrap_or(MAX_TIMER_SLEEP)
            .clamp(MIN_TIMER_SLEEP, MAX_TIMER_SLEEP);
        shared.timers.wait(sleep);
    }
    debug!("timer thread exiting");
}

fn run_event_loop(shared: Arc<SessionShared>, mut events: mpsc::Receiver<SessionEvent>) {
    debug!("event thread started");
    while let Some(event) = events.blocking_recv() {
        if shared.handle_event(event).is_break() {
            break;
        }
    }
    debug!("event thread exiting");
}

fn run_receiver(shared: Arc<SessionShared>, socket: Arc<dyn DatagramSocket>, mut buf: Vec<u8>) -> Vec<u8> {
    debug!("receiver thread started");
    while shared.is_running() {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!("received {} bytes from {}", len, from);
                if let Some(event) = shared.handle_incoming(from, &buf[..len]) {
                    if !shared.post_event(event) {
                        break;
                    }
                }
            }
            Err(SocketError::Aborted) => break,
            Err(SocketError::WouldBlock) => {}
            Err(e) => {
                error!("receiving on port {} failed: {}", shared.config.port, e);
                thread::sleep(RECEIVE_ERROR_BACKOFF);
            }
        }
    }
    debug!("receiver thread exiting");
    buf
}


#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex;
    use std::time::Instant;

    use tracing::warn;

    use crate::matching::matching_config::{MatchingMode, SessionConfig};
    use crate::matching::matching_events::{EventKind, Notification, NotificationHandler};
    use crate::matching::peer::PeerStatus;
    use crate::matching::session::{MatchingSession, SessionStatus};
    use crate::messaging::matching_messages::PacketType;
    use crate::test_util::{opt_packet, TrackingSocketProvider};

    use super::*;

    const OWN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn recording_handler() -> (NotificationHandler, Arc<Mutex<Vec<Notification>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let handler: NotificationHandler = {
            let recorded = recorded.clone();
            Arc::new(move |n: &Notification| recorded.lock().unwrap().push(n.clone()))
        };
        (handler, recorded)
    }

    fn has_notification(recorded: &Mutex<Vec<Notification>>, kind: EventKind, peer: Ipv4Addr) -> bool {
        recorded.lock().unwrap().iter()
            .any(|n| n.kind == kind && n.peer == peer)
    }

    #[test]
    fn test_threads_drive_session() {
        let port = 31000;
        let provider = Arc::new(TrackingSocketProvider::new(OWN));
        let (handler, recorded) = recording_handler();
        let session = MatchingSession::with_provider(SessionConfig::new(MatchingMode::PeerToPeer, port), Some(handler), provider.clone(), || 5).unwrap();

        session.start(Some(b"lobby")).unwrap();
        let send_socket = provider.socket_on(port + 2).unwrap();
        let recv_socket = provider.socket_on(port).unwrap();

        // the timer thread broadcasts Hello right away
        assert!(wait_until(|| send_socket.sent_to(Ipv4Addr::BROADCAST).contains(&PacketType::Hello)));

        let from = SocketAddrV4::new(A, port + 2);
        recv_socket.push_inbound(from, opt_packet(PacketType::HelloAck, b"hey", Some(3)));
        assert!(wait_until(|| session.peer_status(A) == Some(PeerStatus::Negotiating)));
        assert!(wait_until(|| has_notification(&recorded, EventKind::Request, A)));
        assert!(send_socket.sent_to(A).contains(&PacketType::DataProbe));

        session.stop().unwrap();
        assert_eq!(session.status(), SessionStatus::NotRunning);
        assert!(session.peers().is_empty());
        assert_eq!(send_socket.sent_types().iter().filter(|t| **t == PacketType::Bye).count(), 1);
        // the event thread woke the receiver on its way out
        assert!(send_socket.sent().iter().any(|(to, datagram)| *to == SocketAddrV4::new(Ipv4Addr::LOCALHOST, port) && datagram[0] == 0));
    }

    #[test]
    fn test_restart() {
        let port = 31100;
        let provider = Arc::new(TrackingSocketProvider::new(OWN));
        let session = MatchingSession::with_provider(SessionConfig::new(MatchingMode::Child, port), None, provider, || 5).unwrap();

        for _ in 0..3 {
            session.start(None).unwrap();
            assert_eq!(session.status(), SessionStatus::Running);
            session.stop().unwrap();
            assert_eq!(session.status(), SessionStatus::NotRunning);
        }
    }

    fn loopback_config(port: u16, own: Ipv4Addr, other: Ipv4Addr) -> SessionConfig {
        let mut config = SessionConfig::new(MatchingMode::PeerToPeer, port);
        config.local_address = own;
        config.broadcast_address = other;
        config.hello_interval = Duration::from_millis(50);
        config.keepalive_interval = Duration::from_millis(100);
        config.retry_count = 10;
        config
    }

    /// Two peer-to-peer nodes on distinct loopback addresses negotiate and exchange data over real
    ///  UDP sockets.
    #[test]
    fn test_loopback_match_and_data() {
        let port = 32000 + rand::random::<u16>() % 10000;
        let x_addr = Ipv4Addr::new(127, 0, 0, 2);
        let y_addr = Ipv4Addr::new(127, 0, 0, 3);

        let (x_handler, x_recorded) = recording_handler();
        let (y_handler, y_recorded) = recording_handler();
        let x = MatchingSession::new(loopback_config(port, x_addr, y_addr), Some(x_handler)).unwrap();
        let y = MatchingSession::new(loopback_config(port, y_addr, x_addr), Some(y_handler)).unwrap();

        if let Err(e) = x.start(Some(b"x")) {
            warn!("skipping loopback test, cannot bind {}: {}", x_addr, e);
            return;
        }
        if let Err(e) = y.start(Some(b"y")) {
            warn!("skipping loopback test, cannot bind {}: {}", y_addr, e);
            return;
        }

        assert!(wait_until(|| x.peer_status(y_addr).is_some()));
        x.select_peer(y_addr, b"play?").unwrap();
        assert!(wait_until(|| y.peer_status(x_addr) == Some(PeerStatus::Negotiating)));
        assert!(has_notification(&y_recorded, EventKind::Request, x_addr));

        y.select_peer(x_addr, b"sure").unwrap();
        assert!(wait_until(|| x.peer_status(y_addr) == Some(PeerStatus::Established)));
        assert!(wait_until(|| y.peer_status(x_addr) == Some(PeerStatus::Established)));
        assert!(has_notification(&x_recorded, EventKind::Accept, y_addr));

        x.send_data(y_addr, b"ping").unwrap();
        assert!(wait_until(|| has_notification(&x_recorded, EventKind::DataAck, y_addr)));
        let data = y_recorded.lock().unwrap().iter()
            .find(|n| n.kind == EventKind::Data)
            .map(|n| n.opt.clone());
        assert_eq!(data, Some(b"ping".to_vec()));

        assert_eq!(x.members(), vec![x_addr, y_addr]);
        assert_eq!(y.members(), vec![y_addr, x_addr]);

        y.stop().unwrap();
        assert!(wait_until(|| has_notification(&x_recorded, EventKind::Bye, y_addr)));
        x.stop().unwrap();
    }
}
