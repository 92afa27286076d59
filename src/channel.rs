use std::collections::VecDeque;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::errors::WinkError;
use crate::frame::{Frame, MAX_PAYLOAD_SIZE};
use crate::mode::Mode;

/// decoding applied to inbound DATA and EMIT payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// deliver as text, bytes taken verbatim
    Ascii,
    /// deliver as text, lossy UTF-8
    Utf8,
    /// deliver as base64 text
    Base64,
    /// deliver as a parsed JSON value; a parse failure destroys the channel
    Json,
}

/// message payload crossing the channel surface
///
/// On write, `Text` and `Json` set the wire text bit, `Base64` is decoded
/// to binary first. Inbound frames decode into `Binary`, `Text` or `Json`
/// depending on the channel encoding and the frame's text bit.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// raw bytes
    Binary(Bytes),
    /// UTF-8 text
    Text(String),
    /// base64 encoded bytes, decoded before framing
    Base64(String),
    /// JSON value, serialized canonically before framing
    Json(serde_json::Value),
}

impl Payload {
    /// convert to frame bytes plus the text bit; validates size and content
    pub(crate) fn into_wire(self) -> Result<(Bytes, bool), WinkError> {
        let (bytes, text) = match self {
            Payload::Binary(data) => (data, false),
            Payload::Text(data) => (Bytes::from(data), true),
            Payload::Base64(data) => {
                let decoded = BASE64.decode(data).map_err(|_| WinkError::InvalidBase64)?;
                (Bytes::from(decoded), false)
            }
            Payload::Json(value) => {
                let data = serde_json::to_string(&value)
                    .map_err(|e| WinkError::InvalidJson(e.to_string()))?;
                (Bytes::from(data), true)
            }
        };
        if bytes.is_empty() {
            return Err(WinkError::MissingData);
        }
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(WinkError::PayloadTooLarge(bytes.len()));
        }
        Ok((bytes, text))
    }
}

/// decode an inbound payload for delivery
///
/// The channel encoding wins over the frame's text bit; JSON is the only
/// decode that can fail.
pub(crate) fn decode_payload(
    encoding: Option<Encoding>,
    is_text: bool,
    payload: Bytes,
) -> Result<Payload, String> {
    match encoding {
        Some(Encoding::Json) => serde_json::from_slice(&payload)
            .map(Payload::Json)
            .map_err(|e| e.to_string()),
        Some(Encoding::Base64) => Ok(Payload::Text(BASE64.encode(&payload))),
        Some(Encoding::Ascii) | Some(Encoding::Utf8) => {
            Ok(Payload::Text(String::from_utf8_lossy(&payload).to_string()))
        }
        None if is_text => Ok(Payload::Text(String::from_utf8_lossy(&payload).to_string())),
        None => Ok(Payload::Binary(payload)),
    }
}

/// per-channel state, owned by its connection
#[derive(Debug)]
pub(crate) struct Channel {
    /// generation stamp carried by the user handle
    pub gen: u64,
    /// requested id, rewritten if the server redirects
    pub id: u32,
    pub mode: Mode,
    pub encoding: Option<Encoding>,
    /// true until the OPEN response resolves
    pub connecting: bool,
    /// END handshake initiated locally
    pub closing: bool,
    /// terminal; kept only until the close event is emitted
    pub destroyed: bool,
    /// user frames buffered while connecting; drained once on open
    pub write_queue: Option<VecDeque<Frame>>,
    /// END payload deferred until a sent OPEN resolves
    pub end_message: Option<Bytes>,
}

impl Channel {
    pub fn new(gen: u64, id: u32, mode: Mode) -> Self {
        Self {
            gen,
            id,
            mode,
            encoding: None,
            connecting: true,
            closing: false,
            destroyed: false,
            write_queue: Some(VecDeque::new()),
            end_message: None,
        }
    }

    pub fn readable(&self) -> bool {
        self.mode.readable()
    }

    pub fn writable(&self) -> bool {
        self.mode.writable()
    }

    pub fn emitable(&self) -> bool {
        self.mode.emitable()
    }
}
