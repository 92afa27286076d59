//! winksock/1 client toolkit
//!
//! A multiplexed messaging client: any number of logical channels share one
//! TCP socket per authority, established through an HTTP/1.1 upgrade. The
//! core is sans-io: [`Client`] consumes socket bytes and timer expirations
//! through its `handle_*` methods and produces I/O instructions
//! ([`Client::poll_io`]) and channel events ([`Client::poll_event`]); the
//! host event loop owns the sockets. With the `async` feature the bundled
//! [`driver::Driver`] does that plumbing on tokio for plain-TCP targets.

#![warn(missing_docs)]
#![cfg_attr(docrs, feature(doc_auto_cfg))]

/// client error definitions
pub mod errors;
/// wire framing codec
pub mod frame;
/// HTTP upgrade client
pub mod handshake;
/// channel capability bitset
pub mod mode;
/// channel url surface
pub mod url;

/// channel payloads and encodings
pub mod channel;
/// connection pool and host-facing interface
pub mod client;

mod connection;

#[cfg(feature = "async")]
/// bundled tokio TCP driver
pub mod driver;

pub use channel::{Encoding, Payload};
pub use client::{ChannelEvent, ChannelHandle, Client, ConnectionHandle, Io, Timer};
pub use errors::{ChannelError, HandshakeError, ProtocolError, WinkError};
pub use frame::{ALL_CHANNELS, MAX_PAYLOAD_SIZE};
pub use handshake::UPGRADE_PROTOCOL;
pub use mode::Mode;
pub use url::{Authority, ChannelUrl, Scheme};

/// User-Agent sent during the upgrade unless overridden
pub const DEFAULT_AGENT: &str = concat!("winksock-client/", env!("CARGO_PKG_VERSION"));

/// process-wide knobs, fixed at [`Client`] construction
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// honour 301/302/307 during the upgrade handshake
    pub follow_redirects: bool,
    /// Origin header; the target host when unset
    pub origin: Option<String>,
    /// User-Agent header; omitted when unset
    pub agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            origin: None,
            agent: Some(DEFAULT_AGENT.to_string()),
        }
    }
}

impl ClientConfig {
    /// create a config with the defaults
    pub fn new() -> Self {
        Default::default()
    }

    /// honour or refuse handshake redirects
    pub fn follow_redirects(self, follow_redirects: bool) -> Self {
        Self {
            follow_redirects,
            ..self
        }
    }

    /// set the Origin header
    pub fn origin<O: Into<String>>(self, origin: O) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// set the User-Agent header
    pub fn agent<A: Into<String>>(self, agent: A) -> Self {
        Self {
            agent: Some(agent.into()),
            ..self
        }
    }

    /// omit the User-Agent header entirely
    pub fn no_agent(self) -> Self {
        Self {
            agent: None,
            ..self
        }
    }
}
