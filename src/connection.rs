use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use slab::Slab;
use tracing::{debug, trace};

use crate::channel::{decode_payload, Channel, Encoding};
use crate::client::{ChannelEvent, ChannelHandle, ConnectionHandle, Context, Io, Task, Timer};
use crate::errors::{ChannelError, HandshakeError, ProtocolError, ERR_OPEN_DENIED, ERR_UNKNOWN};
use crate::frame::{
    Frame, FrameDecoder, Op, ALL_CHANNELS, OPEN_ALLOW, OPEN_DENY, OPEN_REDIRECT, SIG_EMIT,
    SIG_END, SIG_ERROR,
};
use crate::handshake::{self, Handshake, HandshakeOutcome, HandshakeTarget, MAX_REDIRECTS};
use crate::mode::Mode;
use crate::url::Authority;
use crate::ClientConfig;

/// how long an idle connection keeps its socket for reuse
pub(crate) const DISPOSE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug)]
enum State {
    /// waiting for the host to report the socket connected
    Dialing,
    /// upgrade request sent, parsing the response
    Handshaking(Handshake),
    Live,
    Dead,
}

/// a pending OPEN for one channel id
///
/// Requests for the same id form a FIFO; only the head may be on the wire.
#[derive(Debug)]
struct OpenRequest {
    chan: usize,
    mode: Mode,
    token: Option<Bytes>,
    /// eligible to go out as soon as the socket and the id allow
    present: bool,
    /// transmitted; past the cancel window
    sent: bool,
}

/// one shared socket and its multiplexing state
pub(crate) struct Connection {
    index: usize,
    pub authority: Authority,
    target: HandshakeTarget,
    state: State,
    /// inside the disposal window
    pub lingering: bool,
    redirects: u8,
    recv_buf: BytesMut,
    decoder: FrameDecoder,
    channels: Slab<Channel>,
    by_id: FnvHashMap<u32, usize>,
    requests: FnvHashMap<u32, VecDeque<OpenRequest>>,
    chan_refs: usize,
    req_refs: usize,
    blocked: bool,
}

impl Connection {
    pub fn new(index: usize, authority: Authority) -> Self {
        Self {
            index,
            target: HandshakeTarget::new(authority.clone()),
            authority,
            state: State::Dialing,
            lingering: false,
            redirects: 0,
            recv_buf: BytesMut::new(),
            decoder: FrameDecoder::default(),
            channels: Slab::new(),
            by_id: FnvHashMap::default(),
            requests: FnvHashMap::default(),
            chan_refs: 0,
            req_refs: 0,
            blocked: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, State::Dead)
    }

    fn conn_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.index)
    }

    fn handle(&self, slot: usize) -> ChannelHandle {
        ChannelHandle {
            conn: self.conn_handle(),
            chan: slot,
            gen: self.channels[slot].gen,
        }
    }

    pub fn insert_channel(&mut self, gen: u64, id: u32, mode: Mode) -> usize {
        self.channels.insert(Channel::new(gen, id, mode))
    }

    pub fn channel_ref(&self, slot: usize) -> Option<&Channel> {
        self.channels.get(slot)
    }

    // ===== open pipeline =====

    /// submit an OPEN for `slot` targeting channel `id`
    pub fn open(&mut self, ctx: &mut Context, slot: usize, id: u32, token: Option<Bytes>) {
        if let Some(&existing) = self.by_id.get(&id) {
            if !self.channels[existing].closing {
                // the failure is queued, never raised into the caller
                trace!(conn = self.index, channel = id, "id busy, failing open");
                let handle = self.handle(slot);
                ctx.events
                    .push_back((handle, ChannelEvent::Error(ChannelError::AlreadyOpen)));
                ctx.events.push_back((
                    handle,
                    ChannelEvent::Close {
                        had_error: true,
                        message: None,
                    },
                ));
                self.channels.remove(slot);
                return;
            }
        }
        let mode = self.channels[slot].mode;
        let queue = self.requests.entry(id).or_default();
        let is_head = queue.is_empty();
        queue.push_back(OpenRequest {
            chan: slot,
            mode,
            token,
            present: true,
            sent: false,
        });
        self.req_refs += 1;
        let closing_prior = self.by_id.contains_key(&id);
        if matches!(self.state, State::Live) && !closing_prior && is_head {
            ctx.tasks.push_back(Task::SendOpen {
                conn: self.index,
                id,
            });
        }
    }

    /// transmit the head request for `id` if the socket and the id allow
    pub fn send_open(&mut self, ctx: &mut Context, id: u32) {
        if !matches!(self.state, State::Live) {
            return;
        }
        if self.by_id.contains_key(&id) {
            // predecessor still in its END handshake
            return;
        }
        let frame = {
            let Some(queue) = self.requests.get_mut(&id) else {
                return;
            };
            let Some(head) = queue.front_mut() else {
                return;
            };
            if head.sent || !head.present {
                return;
            }
            head.sent = true;
            Frame::open(id, head.mode.bits(), head.token.clone())
        };
        trace!(conn = self.index, channel = id, "sending open request");
        self.transmit(ctx, frame);
    }

    fn pop_head(&mut self, id: u32) -> Option<OpenRequest> {
        let queue = self.requests.get_mut(&id)?;
        let head = queue.pop_front();
        if queue.is_empty() {
            self.requests.remove(&id);
        }
        head
    }

    /// make the next queued request for `id` eligible
    fn promote_next(&mut self, ctx: &mut Context, id: u32) {
        if self.requests.contains_key(&id) {
            ctx.tasks.push_back(Task::SendOpen {
                conn: self.index,
                id,
            });
        }
    }

    /// kill every queued successor with "Channel is already open"
    fn fail_successors(&mut self, ctx: &mut Context, id: u32) {
        while let Some(req) = self.pop_head(id) {
            self.req_refs -= 1;
            self.finalize_channel(ctx, req.chan, Some(ChannelError::AlreadyOpen), None);
        }
    }

    fn resolve_open(&mut self, ctx: &mut Context, id: u32, resolved: u32, redirected: bool) {
        let Some(head) = self.pop_head(id) else {
            return;
        };
        self.req_refs -= 1;
        let slot = head.chan;
        if self.by_id.contains_key(&resolved) {
            // the server granted an id that is still occupied
            self.destroy(
                ctx,
                Some(ChannelError::Protocol(ProtocolError::BadOpenResp)),
                None,
            );
            return;
        }
        self.by_id.insert(resolved, slot);
        self.chan_refs += 1;
        let handle = self.handle(slot);
        let (closing, end_message, queued) = {
            let ch = &mut self.channels[slot];
            ch.id = resolved;
            ch.connecting = false;
            (ch.closing, ch.end_message.take(), ch.write_queue.take())
        };
        debug!(conn = self.index, channel = resolved, redirected, "channel open");
        if closing {
            // the user already ended this channel; finish the close now
            self.transmit(ctx, Frame::signal(resolved, SIG_END, end_message));
        } else {
            ctx.events
                .push_back((handle, ChannelEvent::Connect { id: resolved }));
            if let Some(queue) = queued {
                let had_frames = !queue.is_empty();
                let mut flushed = true;
                for mut frame in queue {
                    frame.channel = resolved;
                    flushed = self.transmit(ctx, frame);
                }
                if had_frames && flushed {
                    ctx.events.push_back((handle, ChannelEvent::Drain));
                }
            }
        }
        if redirected {
            self.promote_next(ctx, id);
        } else {
            self.fail_successors(ctx, id);
        }
    }

    // ===== connection lifecycle =====

    /// the host finished dialing; send the upgrade request
    pub fn handle_connected(&mut self, ctx: &mut Context, config: &ClientConfig) {
        if !matches!(self.state, State::Dialing) {
            return;
        }
        let request = handshake::request(&self.target, config);
        ctx.io.push_back(Io::Transmit {
            connection: self.conn_handle(),
            data: request,
        });
        self.state = State::Handshaking(Handshake::default());
    }

    pub fn handle_input(&mut self, ctx: &mut Context, data: &[u8], config: &ClientConfig) {
        let outcome = match &mut self.state {
            State::Handshaking(hs) => hs.parse(data, config.follow_redirects),
            State::Live => {
                self.recv_buf.extend_from_slice(data);
                self.process_frames(ctx);
                return;
            }
            State::Dialing | State::Dead => {
                trace!(conn = self.index, "dropping input");
                return;
            }
        };
        match outcome {
            Ok(None) => {}
            Ok(Some(HandshakeOutcome::Upgraded { remainder })) => {
                debug!(conn = self.index, authority = %self.authority, "connection live");
                self.state = State::Live;
                self.recv_buf = remainder;
                self.flush_requests(ctx);
                self.process_frames(ctx);
            }
            Ok(Some(HandshakeOutcome::Redirect { location })) => {
                self.redirects += 1;
                if self.redirects > MAX_REDIRECTS {
                    self.destroy(
                        ctx,
                        Some(ChannelError::Handshake(HandshakeError::MaxRedirects)),
                        None,
                    );
                    return;
                }
                match self.target.redirect(&location) {
                    Ok(target) => {
                        debug!(conn = self.index, %location, "following handshake redirect");
                        ctx.io.push_back(Io::Close {
                            connection: self.conn_handle(),
                        });
                        ctx.io.push_back(Io::Connect {
                            connection: self.conn_handle(),
                            authority: target.authority.clone(),
                        });
                        self.target = target;
                        self.state = State::Dialing;
                    }
                    Err(e) => self.destroy(ctx, Some(ChannelError::Handshake(e)), None),
                }
            }
            Err(e) => self.destroy(ctx, Some(ChannelError::Handshake(e)), None),
        }
    }

    /// every request queued before the upgrade completes goes out now
    fn flush_requests(&mut self, ctx: &mut Context) {
        let mut ids: Vec<u32> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.send_open(ctx, id);
        }
    }

    fn process_frames(&mut self, ctx: &mut Context) {
        loop {
            // halt immediately if a dispatch killed the connection
            if !matches!(self.state, State::Live) {
                return;
            }
            match self.decoder.decode(&mut self.recv_buf) {
                Ok(Some(frame)) => self.dispatch(ctx, frame),
                Ok(None) => return,
                Err(e) => {
                    self.destroy(ctx, Some(ChannelError::Protocol(e)), None);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut Context, frame: Frame) {
        match frame.op {
            Op::Noop => trace!(conn = self.index, "noop frame"),
            Op::Open => self.process_open(ctx, frame),
            Op::Data => self.process_data(ctx, frame),
            Op::Signal => self.process_signal(ctx, frame),
        }
    }

    fn process_open(&mut self, ctx: &mut Context, frame: Frame) {
        let id = frame.channel;
        if !self.requests.contains_key(&id) {
            self.destroy(
                ctx,
                Some(ChannelError::Protocol(ProtocolError::UnknownOpenResponse(
                    id,
                ))),
                None,
            );
            return;
        }
        match frame.flag {
            OPEN_ALLOW => self.resolve_open(ctx, id, id, false),
            OPEN_REDIRECT => {
                if frame.payload.len() != 4 {
                    self.destroy(
                        ctx,
                        Some(ChannelError::Protocol(ProtocolError::BadOpenResp)),
                        None,
                    );
                    return;
                }
                let resolved = u32::from_be_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                self.resolve_open(ctx, id, resolved, true);
            }
            OPEN_DENY => {
                let reason = if frame.payload.is_empty() {
                    ERR_OPEN_DENIED.to_string()
                } else {
                    String::from_utf8_lossy(&frame.payload).to_string()
                };
                let Some(head) = self.pop_head(id) else {
                    return;
                };
                self.req_refs -= 1;
                self.finalize_channel(ctx, head.chan, Some(ChannelError::Denied(reason)), None);
                self.promote_next(ctx, id);
                self.maybe_dispose(ctx);
            }
            _ => self.destroy(
                ctx,
                Some(ChannelError::Protocol(ProtocolError::BadOpenResp)),
                None,
            ),
        }
    }

    fn process_data(&mut self, ctx: &mut Context, frame: Frame) {
        if frame.channel == ALL_CHANNELS {
            let slots: Vec<usize> = self.by_id.values().copied().collect();
            for slot in slots {
                let Some(ch) = self.channels.get(slot) else {
                    continue;
                };
                if ch.readable() {
                    self.deliver_data(ctx, slot, &frame);
                }
            }
        } else if let Some(&slot) = self.by_id.get(&frame.channel) {
            if self.channels[slot].readable() {
                self.deliver_data(ctx, slot, &frame);
            }
        } else {
            trace!(conn = self.index, channel = frame.channel, "data for unknown channel");
        }
    }

    fn deliver_data(&mut self, ctx: &mut Context, slot: usize, frame: &Frame) {
        let encoding = self.channels[slot].encoding;
        match decode_payload(encoding, frame.is_text(), frame.payload.clone()) {
            Ok(payload) => ctx.events.push_back((
                self.handle(slot),
                ChannelEvent::Data {
                    payload,
                    priority: frame.priority(),
                },
            )),
            Err(reason) => {
                debug!(conn = self.index, %reason, "inbound payload decode failed");
                self.finalize_channel(ctx, slot, Some(ChannelError::Payload(reason)), None);
                self.maybe_dispose(ctx);
            }
        }
    }

    fn deliver_signal(&mut self, ctx: &mut Context, slot: usize, frame: &Frame) {
        let encoding = self.channels[slot].encoding;
        // signals carry no text bit; they default to text delivery
        match decode_payload(encoding, true, frame.payload.clone()) {
            Ok(payload) => ctx
                .events
                .push_back((self.handle(slot), ChannelEvent::Signal { payload })),
            Err(reason) => {
                debug!(conn = self.index, %reason, "inbound signal decode failed");
                self.finalize_channel(ctx, slot, Some(ChannelError::Payload(reason)), None);
                self.maybe_dispose(ctx);
            }
        }
    }

    fn process_signal(&mut self, ctx: &mut Context, frame: Frame) {
        match frame.flag {
            SIG_EMIT => {
                if frame.channel == ALL_CHANNELS {
                    // the wildcard skips channels mid-close; a directly
                    // addressed EMIT is still delivered to them
                    let slots: Vec<usize> = self.by_id.values().copied().collect();
                    for slot in slots {
                        let Some(ch) = self.channels.get(slot) else {
                            continue;
                        };
                        if !ch.closing {
                            self.deliver_signal(ctx, slot, &frame);
                        }
                    }
                } else if let Some(&slot) = self.by_id.get(&frame.channel) {
                    self.deliver_signal(ctx, slot, &frame);
                }
            }
            SIG_END | SIG_ERROR => self.process_close_signal(ctx, frame),
            other => self.destroy(
                ctx,
                Some(ChannelError::Protocol(ProtocolError::UnknownSigFlag(other))),
                None,
            ),
        }
    }

    fn process_close_signal(&mut self, ctx: &mut Context, frame: Frame) {
        let is_error = frame.flag == SIG_ERROR;
        let message = if frame.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&frame.payload).to_string())
        };
        if frame.channel == ALL_CHANNELS {
            if is_error {
                let reason = message.unwrap_or_else(|| ERR_UNKNOWN.to_string());
                self.destroy(ctx, Some(ChannelError::Remote(reason)), None);
            } else {
                self.destroy(ctx, None, message);
            }
            return;
        }
        let Some(&slot) = self.by_id.get(&frame.channel) else {
            // tolerated protocol violation
            trace!(conn = self.index, channel = frame.channel, "close signal for unknown channel");
            return;
        };
        let closing = self.channels[slot].closing;
        if !closing {
            // server-initiated close; acknowledge before finalizing
            self.transmit(ctx, Frame::signal(frame.channel, SIG_END, None));
        }
        let (error, close_message) = if is_error {
            let reason = message.unwrap_or_else(|| ERR_UNKNOWN.to_string());
            (Some(ChannelError::Remote(reason)), None)
        } else {
            (None, message)
        };
        self.finalize_channel(ctx, slot, error, close_message);
        // a queued open for this id was waiting on the END handshake
        self.send_open(ctx, frame.channel);
        self.maybe_dispose(ctx);
    }

    // ===== user-facing channel operations =====

    /// frame's channel id is rewritten to the resolved id before transmit
    pub fn write_channel(&mut self, ctx: &mut Context, slot: usize, mut frame: Frame) -> bool {
        let ch = &mut self.channels[slot];
        if ch.destroyed || ch.closing {
            return false;
        }
        if ch.connecting {
            if let Some(queue) = ch.write_queue.as_mut() {
                queue.push_back(frame);
            }
            return false;
        }
        frame.channel = ch.id;
        self.transmit(ctx, frame)
    }

    pub fn end_channel(&mut self, ctx: &mut Context, slot: usize, message: Option<Bytes>) {
        let (connecting, id) = {
            let Some(ch) = self.channels.get(slot) else {
                return;
            };
            if ch.destroyed || ch.closing {
                return;
            }
            (ch.connecting, ch.id)
        };
        if connecting {
            let unsent_at = self.requests.get(&id).and_then(|queue| {
                queue
                    .iter()
                    .position(|req| req.chan == slot)
                    .filter(|&pos| !queue[pos].sent)
            });
            if let Some(pos) = unsent_at {
                // still inside the cancel window
                if let Some(queue) = self.requests.get_mut(&id) {
                    queue.remove(pos);
                    if queue.is_empty() {
                        self.requests.remove(&id);
                    }
                }
                self.req_refs -= 1;
                self.finalize_channel(ctx, slot, None, None);
                if pos == 0 {
                    self.promote_next(ctx, id);
                }
                self.maybe_dispose(ctx);
            } else {
                // on the wire; the END goes out when the open resolves
                let ch = &mut self.channels[slot];
                ch.closing = true;
                ch.end_message = message;
            }
            return;
        }
        self.channels[slot].closing = true;
        self.transmit(ctx, Frame::signal(id, SIG_END, message));
    }

    pub fn set_encoding(&mut self, slot: usize, encoding: Option<Encoding>) {
        if let Some(ch) = self.channels.get_mut(slot) {
            ch.encoding = encoding;
        }
    }

    // ===== teardown and reuse =====

    fn finalize_channel(
        &mut self,
        ctx: &mut Context,
        slot: usize,
        error: Option<ChannelError>,
        message: Option<String>,
    ) {
        let Some(ch) = self.channels.get_mut(slot) else {
            return;
        };
        if ch.destroyed {
            return;
        }
        ch.destroyed = true;
        ch.write_queue = None;
        let id = ch.id;
        let handle = self.handle(slot);
        let had_error = error.is_some();
        if let Some(err) = error {
            ctx.events.push_back((handle, ChannelEvent::Error(err)));
        }
        ctx.events
            .push_back((handle, ChannelEvent::Close { had_error, message }));
        if self.by_id.get(&id).copied() == Some(slot) {
            self.by_id.remove(&id);
            self.chan_refs -= 1;
        }
        self.channels.remove(slot);
    }

    /// terminal; fans the root cause to every channel and request once
    pub fn destroy(
        &mut self,
        ctx: &mut Context,
        error: Option<ChannelError>,
        message: Option<String>,
    ) {
        if matches!(self.state, State::Dead) {
            return;
        }
        debug!(conn = self.index, ?error, "destroying connection");
        self.state = State::Dead;
        self.recv_buf.clear();
        self.requests.clear();
        self.req_refs = 0;
        let slots: Vec<usize> = self.channels.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.finalize_channel(ctx, slot, error.clone(), message.clone());
        }
        self.chan_refs = 0;
        if self.lingering {
            ctx.io.push_back(Io::TimerStop {
                connection: self.conn_handle(),
                timer: Timer::Dispose,
            });
        }
        ctx.io.push_back(Io::Close {
            connection: self.conn_handle(),
        });
    }

    fn maybe_dispose(&mut self, ctx: &mut Context) {
        if self.lingering || matches!(self.state, State::Dead) {
            return;
        }
        if self.chan_refs == 0 && self.req_refs == 0 {
            debug!(conn = self.index, "idle, entering disposal window");
            self.lingering = true;
            ctx.io.push_back(Io::TimerStart {
                connection: self.conn_handle(),
                timer: Timer::Dispose,
                after: DISPOSE_TIMEOUT,
            });
        }
    }

    /// a new channel claimed this connection inside the disposal window
    pub fn revive(&mut self, ctx: &mut Context) {
        if self.lingering {
            debug!(conn = self.index, "reviving disposed connection");
            self.lingering = false;
            ctx.io.push_back(Io::TimerStop {
                connection: self.conn_handle(),
                timer: Timer::Dispose,
            });
        }
    }

    pub fn handle_timeout(&mut self, ctx: &mut Context, timer: Timer) {
        match timer {
            Timer::Dispose => {
                if self.lingering {
                    debug!(conn = self.index, "disposal window expired");
                    self.destroy(ctx, None, None);
                }
            }
        }
    }

    pub fn handle_blocked(&mut self) {
        self.blocked = true;
    }

    /// the socket drained; fan `Drain` to every registered channel
    pub fn handle_drained(&mut self, ctx: &mut Context) {
        self.blocked = false;
        let slots: Vec<usize> = self.by_id.values().copied().collect();
        for slot in slots {
            let Some(ch) = self.channels.get(slot) else {
                continue;
            };
            if !ch.closing {
                ctx.events.push_back((self.handle(slot), ChannelEvent::Drain));
            }
        }
    }

    fn transmit(&mut self, ctx: &mut Context, frame: Frame) -> bool {
        if matches!(self.state, State::Dead) {
            return false;
        }
        ctx.io.push_back(Io::Transmit {
            connection: self.conn_handle(),
            data: frame.encode(),
        });
        !self.blocked
    }
}
