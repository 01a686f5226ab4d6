pub mod matching_config;
pub mod matching_error;
pub mod matching_events;
pub mod peer;
pub mod peer_state_machine;
pub mod registry;
pub mod session;
mod workers;
