use crate::messaging::datagram_socket::SocketError;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MatchingError {
    #[error("invalid mode")]
    InvalidMode,
    #[error("invalid port")]
    InvalidPort,
    #[error("invalid maximum number of peers")]
    InvalidMaxNum,
    #[error("receive buffer too short")]
    RxBufTooShort,
    #[error("invalid opt length")]
    InvalidOptLen,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid session id")]
    InvalidId,
    #[error("no session id available")]
    IdNotAvailable,
    /// an allocation failed
    #[error("out of memory")]
    NoSpace,
    #[error("session is running")]
    IsRunning,
    #[error("session is not running")]
    NotRunning,
    #[error("unknown target")]
    UnknownTarget,
    #[error("target is not ready")]
    TargetNotReady,
    #[error("maximum number of peers exceeded")]
    ExceedMaxNum,
    #[error("request already in progress")]
    RequestInProgress,
    #[error("already established")]
    AlreadyEstablished,
    #[error("busy")]
    Busy,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not initialized")]
    NotInitialized,
    #[error("port already in use")]
    PortInUse,
    #[error("invalid data length")]
    InvalidDataLen,
    #[error("not established")]
    NotEstablished,
    #[error("previous data send still in progress")]
    DataBusy,
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

impl MatchingError {
    /// The 32-bit status code the reference adhoc matching library reports for this error, for
    ///  hosts that surface codes rather than Rust errors. Socket errors pass through as
    ///  [SocketError::code].
    pub fn code(&self) -> u32 {
        match self {
            MatchingError::InvalidMode => 0x80413101,
            MatchingError::InvalidPort => 0x80413102,
            MatchingError::InvalidMaxNum => 0x80413103,
            MatchingError::RxBufTooShort => 0x80413104,
            MatchingError::InvalidOptLen => 0x80413105,
            MatchingError::InvalidArgument => 0x80413106,
            MatchingError::InvalidId => 0x80413107,
            MatchingError::IdNotAvailable => 0x80413108,
            MatchingError::NoSpace => 0x80413109,
            MatchingError::IsRunning => 0x8041310a,
            MatchingError::NotRunning => 0x8041310b,
            MatchingError::UnknownTarget => 0x8041310c,
            MatchingError::TargetNotReady => 0x8041310d,
            MatchingError::ExceedMaxNum => 0x8041310e,
            MatchingError::RequestInProgress => 0x8041310f,
            MatchingError::AlreadyEstablished => 0x80413110,
            MatchingError::Busy => 0x80413111,
            MatchingError::AlreadyInitialized => 0x80413112,
            MatchingError::NotInitialized => 0x80413113,
            MatchingError::PortInUse => 0x80413114,
            MatchingError::InvalidDataLen => 0x80413116,
            MatchingError::NotEstablished => 0x80413117,
            MatchingError::DataBusy => 0x80413118,
            // malformed input never surfaces through the API, it is dropped by the receiver
            MatchingError::MalformedPacket(_) => 0x80413106,
            MatchingError::Socket(e) => e.code(),
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::invalid_mode(MatchingError::InvalidMode, 0x80413101)]
    #[case::no_space(MatchingError::NoSpace, 0x80413109)]
    #[case::exceed_max_num(MatchingError::ExceedMaxNum, 0x8041310e)]
    #[case::port_in_use(MatchingError::PortInUse, 0x80413114)]
    #[case::data_busy(MatchingError::DataBusy, 0x80413118)]
    #[case::socket_in_use(MatchingError::Socket(SocketError::AddressInUse), 0x80410130)]
    fn test_code(#[case] error: MatchingError, #[case] code: u32) {
        assert_eq!(error.code(), code);
    }

    #[test]
    fn test_socket_error_conversion() {
        let e: MatchingError = SocketError::HostUnreachable.into();
        assert_eq!(e, MatchingError::Socket(SocketError::HostUnreachable));
        assert_eq!(e.to_string(), "socket error: host unreachable");
    }
}
