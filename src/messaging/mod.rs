pub mod datagram_socket;
pub mod matching_messages;
