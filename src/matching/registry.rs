use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::matching::matching_config::{SessionConfig, MAX_PEERS};
use crate::matching::matching_error::MatchingError;
use crate::matching::matching_events::NotificationHandler;
use crate::matching::session::{MatchingSession, SessionStatus};
use crate::messaging::datagram_socket::{SocketProvider, UdpSocketProvider};
use crate::util::random::{initial_peer_id, RngRandom};

pub type SessionId = u32;

struct Sessions {
    by_id: FxHashMap<SessionId, Arc<MatchingSession>>,
    last_id: SessionId,
}

impl Sessions {
    /// the next free id after the most recently allocated one, wrapping within `1..MAX_PEERS`
    fn next_free_id(&self) -> Option<SessionId> {
        let num_ids = MAX_PEERS as SessionId - 1;
        (1..=num_ids)
            .map(|offset| (self.last_id + offset - 1) % num_ids + 1)
            .find(|id| !self.by_id.contains_key(id))
    }
}

/// All matching sessions of a process, addressed by small integer ids.
///
/// The registry must be initialized before sessions can be created, and can only be terminated
///  while none of its sessions is running.
#[derive(Default)]
pub struct MatchingRegistry {
    sessions: Mutex<Option<Sessions>>,
}

impl MatchingRegistry {
    pub fn new() -> MatchingRegistry {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Sessions>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init(&self) -> Result<(), MatchingError> {
        let mut sessions = self.lock();
        if sessions.is_some() {
            return Err(MatchingError::AlreadyInitialized);
        }
        *sessions = Some(Sessions {
            by_id: FxHashMap::default(),
            last_id: 0,
        });
        debug!("matching registry initialized");
        Ok(())
    }

    /// Drops all sessions. Fails with [MatchingError::Busy] while any of them is not stopped.
    pub fn term(&self) -> Result<(), MatchingError> {
        let mut sessions = self.lock();
        let Some(current) = sessions.as_ref() else {
            return Err(MatchingError::NotInitialized);
        };
        if current.by_id.values().any(|s| s.status() != SessionStatus::NotRunning) {
            return Err(MatchingError::Busy);
        }
        *sessions = None;
        debug!("matching registry terminated");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Creates a session over real UDP sockets and returns its id.
    pub fn create(&self, config: SessionConfig, handler: Option<NotificationHandler>) -> Result<SessionId, MatchingError> {
        self.create_with_provider(config, handler, Arc::new(UdpSocketProvider::default()))
    }

    pub fn create_with_provider(&self, config: SessionConfig, handler: Option<NotificationHandler>, provider: Arc<dyn SocketProvider>) -> Result<SessionId, MatchingError> {
        let mut sessions = self.lock();
        let Some(sessions) = sessions.as_mut() else {
            return Err(MatchingError::NotInitialized);
        };

        if sessions.by_id.values().any(|s| s.config().port == config.port) {
            return Err(MatchingError::PortInUse);
        }
        let id = sessions.next_free_id()
            .ok_or(MatchingError::IdNotAvailable)?;

        let session = MatchingSession::with_provider(config, handler, provider, initial_peer_id::<RngRandom>)?;
        info!("created session #{}: {:?}", id, session);
        sessions.by_id.insert(id, Arc::new(session));
        sessions.last_id = id;
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<MatchingSession>, MatchingError> {
        self.lock().as_ref()
            .and_then(|sessions| sessions.by_id.get(&id))
            .cloned()
            .ok_or(MatchingError::InvalidId)
    }

    /// Removes a stopped session.
    pub fn delete(&self, id: SessionId) -> Result<(), MatchingError> {
        let mut sessions = self.lock();
        let sessions = sessions.as_mut()
            .ok_or(MatchingError::InvalidId)?;

        match sessions.by_id.get(&id) {
            None => Err(MatchingError::InvalidId),
            Some(session) if session.status() != SessionStatus::NotRunning => Err(MatchingError::IsRunning),
            Some(_) => {
                sessions.by_id.remove(&id);
                debug!("deleted session #{}", id);
                Ok(())
            }
        }
    }

    /// ids of all sessions, ascending
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.lock().as_ref()
            .map(|sessions| sessions.by_id.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}


#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use crate::matching::matching_config::MatchingMode;
    use crate::test_util::TrackingSocketProvider;

    use super::*;

    fn config(port: u16) -> SessionConfig {
        SessionConfig::new(MatchingMode::PeerToPeer, port)
    }

    fn provider() -> Arc<TrackingSocketProvider> {
        Arc::new(TrackingSocketProvider::new(Ipv4Addr::new(10, 0, 0, 1)))
    }

    fn initialized() -> MatchingRegistry {
        let registry = MatchingRegistry::new();
        registry.init().unwrap();
        registry
    }

    #[test]
    fn test_init_term() {
        let registry = MatchingRegistry::new();
        assert!(!registry.is_initialized());
        assert_eq!(registry.term(), Err(MatchingError::NotInitialized));

        registry.init().unwrap();
        assert_eq!(registry.init(), Err(MatchingError::AlreadyInitialized));
        registry.create_with_provider(config(1000), None, provider()).unwrap();

        registry.term().unwrap();
        assert!(!registry.is_initialized());
        assert_eq!(registry.get(1).unwrap_err(), MatchingError::InvalidId);

        registry.init().unwrap();
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_create_requires_init() {
        let registry = MatchingRegistry::new();
        assert_eq!(registry.create_with_provider(config(1000), None, provider()), Err(MatchingError::NotInitialized));
    }

    #[test]
    fn test_create_rejects_duplicate_port() {
        let registry = initialized();
        registry.create_with_provider(config(1000), None, provider()).unwrap();
        assert_eq!(registry.create_with_provider(config(1000), None, provider()), Err(MatchingError::PortInUse));
        assert_eq!(registry.ids(), vec![1]);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let registry = initialized();
        assert_eq!(registry.create_with_provider(config(0), None, provider()), Err(MatchingError::InvalidPort));
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_ids_are_round_robin() {
        let registry = initialized();
        assert_eq!(registry.create_with_provider(config(1000), None, provider()), Ok(1));
        assert_eq!(registry.create_with_provider(config(1001), None, provider()), Ok(2));

        // a freed id is not reused before the others
        registry.delete(1).unwrap();
        assert_eq!(registry.create_with_provider(config(1002), None, provider()), Ok(3));
    }

    #[test]
    fn test_ids_exhausted() {
        let registry = initialized();
        for n in 1..MAX_PEERS as u16 {
            assert_eq!(registry.create_with_provider(config(1000 + n), None, provider()), Ok(n as SessionId));
        }
        assert_eq!(registry.create_with_provider(config(2000), None, provider()), Err(MatchingError::IdNotAvailable));

        // wraps around to the lowest free id
        registry.delete(4).unwrap();
        assert_eq!(registry.create_with_provider(config(2000), None, provider()), Ok(4));
    }

    #[test]
    fn test_running_session_blocks_delete_and_term() {
        let registry = initialized();
        let id = registry.create_with_provider(config(1000), None, provider()).unwrap();
        let session = registry.get(id).unwrap();

        session.start(None).unwrap();
        assert_eq!(registry.delete(id), Err(MatchingError::IsRunning));
        assert_eq!(registry.term(), Err(MatchingError::Busy));

        session.stop().unwrap();
        registry.delete(id).unwrap();
        assert_eq!(registry.delete(id), Err(MatchingError::InvalidId));
        registry.term().unwrap();
    }
}
