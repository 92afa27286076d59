use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::ProtocolError;

/// fixed frame header size: length, channel id, descriptor
pub const HEADER_LEN: usize = 7;

/// largest payload a single frame may carry
pub const MAX_PAYLOAD_SIZE: usize = 10240;

/// largest frame the decoder accepts
pub const MAX_FRAME_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_SIZE;

/// wildcard channel id used by the server to address every channel
///
/// Valid only on inbound DATA/SIGNAL dispatch, never as an open target.
pub const ALL_CHANNELS: u32 = 0;

/// frame operation, high 3 bits of the descriptor byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// keep-alive filler, ignored on receipt
    Noop,
    /// open request (client) or open response (server)
    Open,
    /// application payload
    Data,
    /// out-of-band signal: EMIT, END or ERROR
    Signal,
}

impl Op {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            Op::Noop => 0x0,
            Op::Open => 0x1,
            Op::Data => 0x2,
            Op::Signal => 0x3,
        }
    }

    fn from_u8(val: u8) -> Op {
        match val {
            0x0 => Op::Noop,
            0x1 => Op::Open,
            0x2 => Op::Data,
            _ => Op::Signal,
        }
    }
}

/// OPEN response flag: request granted on the requested id
pub const OPEN_ALLOW: u8 = 0x0;
/// OPEN response flag: granted on a server-assigned id (payload = 4-byte id)
pub const OPEN_REDIRECT: u8 = 0x1;
/// OPEN response flag: refused, payload is a UTF-8 reason
pub const OPEN_DENY: u8 = 0x7;

/// SIGNAL flag: out-of-band user message
pub const SIG_EMIT: u8 = 0x0;
/// SIGNAL flag: close handshake
pub const SIG_END: u8 = 0x1;
/// SIGNAL flag: close with error
pub const SIG_ERROR: u8 = 0x7;

/// one length-prefixed unit on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// target channel id, `ALL_CHANNELS` for broadcast
    pub channel: u32,
    /// frame operation
    pub op: Op,
    /// op-specific flag, low 3 bits of the descriptor
    pub flag: u8,
    /// payload bytes, at most `MAX_PAYLOAD_SIZE`
    pub payload: Bytes,
}

impl Frame {
    /// construct an OPEN request, flag is the mode bitset
    pub fn open(channel: u32, mode: u8, token: Option<Bytes>) -> Self {
        Self {
            channel,
            op: Op::Open,
            flag: mode,
            payload: token.unwrap_or_default(),
        }
    }

    /// construct a DATA frame
    pub fn data(channel: u32, flag: u8, payload: Bytes) -> Self {
        Self {
            channel,
            op: Op::Data,
            flag,
            payload,
        }
    }

    /// construct a SIGNAL frame
    pub fn signal(channel: u32, flag: u8, payload: Option<Bytes>) -> Self {
        Self {
            channel,
            op: Op::Signal,
            flag,
            payload: payload.unwrap_or_default(),
        }
    }

    /// text bit of a DATA flag
    pub fn is_text(&self) -> bool {
        self.flag & 0x1 != 0
    }

    /// user-facing priority 1..=4 decoded from a DATA flag
    pub fn priority(&self) -> u8 {
        ((self.flag >> 1) & 0x3) + 1
    }

    /// serialize into wire bytes
    pub fn encode(&self) -> Bytes {
        let len = HEADER_LEN + self.payload.len();
        debug_assert!(len <= MAX_FRAME_SIZE);
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u16(len as u16);
        buf.put_u32(self.channel);
        buf.put_u8((self.op.as_u8() << 3) | self.flag);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// build a DATA flag from the text bit and a validated priority 1..=4
pub(crate) fn data_flag(text: bool, priority: u8) -> u8 {
    ((priority - 1) << 1) | text as u8
}

/// incremental frame decoder
///
/// Operates on a caller-owned buffer: partial input returns `Ok(None)` and
/// leaves the tail in place for the next chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl FrameDecoder {
    /// decode one frame if a complete one is buffered
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len < HEADER_LEN {
            return Err(ProtocolError::BadPacketSize(len as u16));
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::PacketTooLarge(len));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut head = src.split_to(len);
        head.advance(2);
        let channel = head.get_u32();
        let desc = head.get_u8();
        // Legacy descriptor bit-twiddle, kept bit-identical to the servers.
        let op = Op::from_u8(((desc >> 1) & 0xF) >> 2);
        let flag = ((desc << 1) & 0xF) >> 1;
        tracing::trace!(channel, ?op, flag, len, "decoded frame");
        Ok(Some(Frame {
            channel,
            op,
            flag,
            payload: head.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn raw(len: u16, channel: u32, desc: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(len);
        buf.put_u32(channel);
        buf.put_u8(desc);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::data(0x112233, data_flag(true, 1), Bytes::from_static(b"Hello"));
        let mut src = BytesMut::from(&frame.encode()[..]);
        let back = FrameDecoder::default().decode(&mut src).unwrap().unwrap();
        assert_eq!(back, frame);
        assert!(back.is_text());
        assert_eq!(back.priority(), 1);
        assert!(src.is_empty());
    }

    #[test]
    fn descriptor_layout() {
        let frame = Frame::signal(9, SIG_ERROR, None);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..2], &[0, 7]);
        assert_eq!(&bytes[2..6], &[0, 0, 0, 9]);
        assert_eq!(bytes[6], (0x3 << 3) | 0x7);
    }

    #[test]
    fn priority_maps_to_flag_bits() {
        for priority in 1..=4u8 {
            let frame = Frame::data(1, data_flag(false, priority), Bytes::new());
            assert_eq!(frame.priority(), priority);
            assert!(!frame.is_text());
        }
    }

    #[test]
    fn partial_input_retains_tail() {
        let frame = Frame::open(5, 0x3, Some(Bytes::from_static(b"token")));
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::default();
        let mut src = BytesMut::from(&encoded[..4]);
        assert_matches!(decoder.decode(&mut src), Ok(None));
        assert_eq!(src.len(), 4);
        src.extend_from_slice(&encoded[4..]);
        assert_eq!(decoder.decode(&mut src).unwrap().unwrap(), frame);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let a = Frame::data(1, data_flag(true, 2), Bytes::from_static(b"a"));
        let b = Frame::signal(1, SIG_END, None);
        let mut src = BytesMut::new();
        src.extend_from_slice(&a.encode());
        src.extend_from_slice(&b.encode());
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(&mut src).unwrap().unwrap(), a);
        assert_eq!(decoder.decode(&mut src).unwrap().unwrap(), b);
        assert_matches!(decoder.decode(&mut src), Ok(None));
    }

    #[test]
    fn short_length_is_fatal() {
        let mut src = raw(5, 1, 0, &[]);
        assert_matches!(
            FrameDecoder::default().decode(&mut src),
            Err(ProtocolError::BadPacketSize(5))
        );
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut src = raw((MAX_FRAME_SIZE + 1) as u16, 1, 0, &[]);
        assert_matches!(
            FrameDecoder::default().decode(&mut src),
            Err(ProtocolError::PacketTooLarge(_))
        );
    }
}
