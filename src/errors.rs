use thiserror::Error;

use crate::frame::MAX_PAYLOAD_SIZE;

/// errors raised synchronously at the call site
///
/// None of these mutate client or channel state.
#[derive(Debug, Error)]
pub enum WinkError {
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("invalid mode expression `{0}`")]
    InvalidMode(String),
    #[error("invalid priority {0}, expected 1..=4")]
    InvalidPriority(u8),
    #[error("missing data")]
    MissingData,
    #[error("payload too large, max payload size {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),
    #[error("token too large, max token size {0}")]
    TokenTooLarge(usize),
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("invalid json payload: {0}")]
    InvalidJson(String),
    #[error("channel is not writable")]
    NotWritable,
    #[error("channel is not emitable")]
    NotEmitable,
}

/// errors during the HTTP upgrade handshake
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// 101 carried an upgrade token other than `winksock/1`
    #[error("Bad protocol version")]
    BadProtocolVersion,
    /// the redirect chain exceeded the hop limit
    #[error("Max HTTP redirections reached")]
    MaxRedirects,
    /// any terminal non-upgrade status
    #[error("{reason}")]
    BadStatus { code: u16, reason: String },
    /// the response could not be parsed as HTTP/1.1
    #[error("malformed handshake response")]
    Malformed,
    /// a 3xx response without a Location header
    #[error("redirect response missing location")]
    MissingLocation,
    /// a Location header that does not parse as a target
    #[error("invalid redirect location `{0}`")]
    BadLocation(String),
}

/// wire violations, fatal to the entire connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad packet size")]
    BadPacketSize(u16),
    #[error("packet too large, {0} bytes")]
    PacketTooLarge(usize),
    #[error("Bad open resp")]
    BadOpenResp,
    #[error("unknown SIGFLAG {0}")]
    UnknownSigFlag(u8),
    #[error("open response to unknown channel {0}")]
    UnknownOpenResponse(u32),
}

/// close causes surfaced on a channel's `Error` event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Handshake(#[from] HandshakeError),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// server denied the open, payload is the reason
    #[error("{0}")]
    Denied(String),
    /// socket closed, reset, or failed to connect
    #[error("{0}")]
    Transport(String),
    /// server-initiated SIGNAL ERROR, payload is the reason
    #[error("{0}")]
    Remote(String),
    /// inbound payload failed to decode, fatal to this channel only
    #[error("{0}")]
    Payload(String),
    #[error("Channel is already open")]
    AlreadyOpen,
}

/// default reason when a DENY carries no payload
pub(crate) const ERR_OPEN_DENIED: &str = "ERR_OPEN_DENIED";
/// default reason when a SIGNAL ERROR carries no payload
pub(crate) const ERR_UNKNOWN: &str = "ERR_UNKNOWN";
