use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

/// What happened to a peer, as reported to the session's owner.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum EventKind {
    /// a peer advertised itself and there is room to match with it
    Hello = 1,
    /// a peer asks to be matched
    Request = 2,
    /// an established peer left
    Leave = 3,
    /// a peer declined our request
    Deny = 4,
    /// a peer withdrew its request
    Cancel = 5,
    /// a peer accepted our request
    Accept = 6,
    Established = 7,
    Timeout = 8,
    /// the peer violated the protocol
    Error = 9,
    Bye = 10,
    Data = 11,
    DataAck = 12,
    DataTimeout = 13,
}

#[derive(Clone, Eq, PartialEq)]
pub struct Notification {
    pub kind: EventKind,
    pub peer: Ipv4Addr,
    pub opt: Vec<u8>,
}
impl Debug for Notification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{}", self.kind, self.peer)?;
        if !self.opt.is_empty() {
            write!(f, "[{}b]", self.opt.len())?;
        }
        Ok(())
    }
}

/// Invoked once per notification, on the session's event thread unless the host drains the
///  queue itself. The handler runs without any session lock held, so it may call back into the
///  session's API (except `stop()`).
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// FIFO of notifications that were produced under the session lock and are not yet delivered.
#[derive(Default)]
pub struct NotificationQueue {
    queue: VecDeque<Notification>,
}
impl NotificationQueue {
    pub fn push(&mut self, kind: EventKind, peer: Ipv4Addr, opt: Vec<u8>) {
        let notification = Notification { kind, peer, opt };
        trace!("notification: {:?}", notification);
        self.queue.push_back(notification);
    }

    pub fn drain(&mut self) -> Vec<Notification> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
