use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use fnv::FnvHashMap;
use slab::Slab;
use tracing::debug;

use crate::channel::{Encoding, Payload};
use crate::connection::Connection;
use crate::errors::{ChannelError, WinkError};
use crate::frame::{data_flag, Frame, MAX_PAYLOAD_SIZE, SIG_EMIT};
use crate::mode::Mode;
use crate::url::{Authority, ChannelUrl};
use crate::ClientConfig;

/// index of a pooled connection, carried by `Io` instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub(crate) usize);

/// user handle to one channel
///
/// Generation-stamped so a handle that outlives its channel degrades into
/// silent no-ops instead of touching a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub(crate) conn: ConnectionHandle,
    pub(crate) chan: usize,
    pub(crate) gen: u64,
}

impl ChannelHandle {
    /// connection this channel is multiplexed over
    pub fn connection(&self) -> ConnectionHandle {
        self.conn
    }
}

/// events delivered to the application, pulled via [`Client::poll_event`]
///
/// Per channel, `Connect` precedes everything, `Error` (if any) precedes
/// `Close`, and `Close` fires exactly once and is last.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// the OPEN resolved; `id` is the resolved channel id
    Connect {
        /// server-assigned id when the open was redirected
        id: u32,
    },
    /// inbound DATA
    Data {
        /// decoded per the channel encoding or the frame text bit
        payload: Payload,
        /// user-facing priority 1..=4
        priority: u8,
    },
    /// inbound out-of-band EMIT signal
    Signal {
        /// decoded per the channel encoding
        payload: Payload,
    },
    /// the socket drained after reporting backpressure
    Drain,
    /// the cause of an upcoming `Close { had_error: true }`
    Error(ChannelError),
    /// terminal event, exactly one per channel
    Close {
        /// whether an `Error` preceded this close
        had_error: bool,
        /// optional close message from the END signal
        message: Option<String>,
    },
}

/// I/O instructions for the backend, pulled via [`Client::poll_io`]
///
/// The client performs no I/O itself; the host executes these against real
/// sockets and timers and reports back through the `handle_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Io {
    /// dial a TCP (or TLS for `https`) stream with nodelay and keepalive,
    /// then call [`Client::handle_connected`]
    Connect {
        /// connection to report the dial result on
        connection: ConnectionHandle,
        /// where to dial
        authority: Authority,
    },
    /// write these bytes to the connection's stream, in order
    Transmit {
        /// connection owning the stream
        connection: ConnectionHandle,
        /// wire bytes
        data: Bytes,
    },
    /// drop the connection's stream
    Close {
        /// connection whose stream is done
        connection: ConnectionHandle,
    },
    /// start (or restart) a timer; on expiry call [`Client::handle_timeout`]
    TimerStart {
        /// connection the timer belongs to
        connection: ConnectionHandle,
        /// which timer
        timer: Timer,
        /// relative expiry
        after: Duration,
    },
    /// cancel a previously started timer
    TimerStop {
        /// connection the timer belongs to
        connection: ConnectionHandle,
        /// which timer
        timer: Timer,
    },
}

/// timers a connection may ask the host to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// disposal window of an idle connection
    Dispose,
}

/// deferred work, drained before any host-facing call makes progress
pub(crate) enum Task {
    /// transmit the head open request for a channel id
    SendOpen { conn: usize, id: u32 },
}

/// queues shared between the client and its connections
pub(crate) struct Context {
    pub events: VecDeque<(ChannelHandle, ChannelEvent)>,
    pub io: VecDeque<Io>,
    pub tasks: VecDeque<Task>,
}

/// multiplexed winksock/1 client
///
/// Owns one pooled [`Connection`] per authority and any number of channels
/// per connection. Performs no I/O: the host drives it with `handle_*`
/// calls and executes the instructions from [`Client::poll_io`].
pub struct Client {
    config: ClientConfig,
    connections: Slab<Connection>,
    by_authority: FnvHashMap<Authority, usize>,
    /// idle connections inside their disposal window, still claimable
    disposed: FnvHashMap<Authority, usize>,
    ctx: Context,
    next_gen: u64,
}

impl Client {
    /// construct a client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connections: Slab::new(),
            by_authority: FnvHashMap::default(),
            disposed: FnvHashMap::default(),
            ctx: Context {
                events: VecDeque::new(),
                io: VecDeque::new(),
                tasks: VecDeque::new(),
            },
            next_gen: 0,
        }
    }

    /// open a channel
    ///
    /// Validation failures are returned synchronously and leave no trace;
    /// every later failure surfaces as `Error`/`Close` events on the
    /// returned handle. The connection for the url's authority is shared,
    /// revived from its disposal window, or dialed fresh.
    pub fn open(&mut self, url: &str, mode: &str) -> Result<ChannelHandle, WinkError> {
        self.run_tasks();
        let url = ChannelUrl::parse(url)?;
        let mode: Mode = mode.parse()?;
        let idx = self.get_connection(&url.authority);
        let gen = self.next_gen;
        self.next_gen += 1;
        let slot = self.connections[idx].insert_channel(gen, url.channel, mode);
        self.connections[idx].open(&mut self.ctx, slot, url.channel, url.token);
        self.settle();
        Ok(ChannelHandle {
            conn: ConnectionHandle(idx),
            chan: slot,
            gen,
        })
    }

    /// write application data to a channel
    ///
    /// Returns whether the bytes were flushed (`false` while queued during
    /// open or when the socket reported backpressure). Writes on a dead
    /// connection or a stale handle return `Ok(false)` silently.
    pub fn write(
        &mut self,
        handle: ChannelHandle,
        payload: Payload,
        priority: u8,
    ) -> Result<bool, WinkError> {
        self.run_tasks();
        if !(1..=4).contains(&priority) {
            return Err(WinkError::InvalidPriority(priority));
        }
        let (bytes, text) = payload.into_wire()?;
        let Some((conn, slot)) = self.lookup(handle) else {
            return Ok(false);
        };
        if !self.connections[conn]
            .channel_ref(slot)
            .is_some_and(|ch| ch.writable())
        {
            return Err(WinkError::NotWritable);
        }
        let frame = Frame::data(0, data_flag(text, priority), bytes);
        Ok(self.connections[conn].write_channel(&mut self.ctx, slot, frame))
    }

    /// emit an out-of-band signal on a channel
    ///
    /// Same payload rules and return value as [`Client::write`].
    pub fn dispatch(&mut self, handle: ChannelHandle, payload: Payload) -> Result<bool, WinkError> {
        self.run_tasks();
        let (bytes, _) = payload.into_wire()?;
        let Some((conn, slot)) = self.lookup(handle) else {
            return Ok(false);
        };
        if !self.connections[conn]
            .channel_ref(slot)
            .is_some_and(|ch| ch.emitable())
        {
            return Err(WinkError::NotEmitable);
        }
        let frame = Frame::signal(0, SIG_EMIT, Some(bytes));
        Ok(self.connections[conn].write_channel(&mut self.ctx, slot, frame))
    }

    /// close a channel, optionally with a UTF-8 message
    ///
    /// Idempotent. An open still inside its cancel window is withdrawn
    /// without touching the wire; otherwise the END handshake runs and the
    /// `Close` event arrives once the server acknowledges.
    pub fn end(&mut self, handle: ChannelHandle, message: Option<&str>) -> Result<(), WinkError> {
        self.run_tasks();
        let payload = match message {
            None | Some("") => None,
            Some(text) => {
                if text.len() > MAX_PAYLOAD_SIZE {
                    return Err(WinkError::PayloadTooLarge(text.len()));
                }
                Some(Bytes::copy_from_slice(text.as_bytes()))
            }
        };
        let Some((conn, slot)) = self.lookup(handle) else {
            return Ok(());
        };
        self.connections[conn].end_channel(&mut self.ctx, slot, payload);
        self.settle();
        Ok(())
    }

    /// set the decoding applied to inbound DATA and EMIT payloads
    pub fn set_encoding(&mut self, handle: ChannelHandle, encoding: Option<Encoding>) {
        if let Some((conn, slot)) = self.lookup(handle) {
            self.connections[conn].set_encoding(slot, encoding);
        }
    }

    /// resolved id of a channel, once its OPEN has been answered
    pub fn channel_id(&self, handle: ChannelHandle) -> Option<u32> {
        let conn = self.connections.get(handle.conn.0)?;
        let ch = conn.channel_ref(handle.chan)?;
        (ch.gen == handle.gen && !ch.connecting && !ch.destroyed).then_some(ch.id)
    }

    /// number of pooled connections, disposal window included
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// true when nothing is pooled, queued, or pending
    pub fn is_idle(&self) -> bool {
        self.connections.is_empty()
            && self.ctx.events.is_empty()
            && self.ctx.io.is_empty()
            && self.ctx.tasks.is_empty()
    }

    // ===== host interface =====

    /// next application event, if any
    pub fn poll_event(&mut self) -> Option<(ChannelHandle, ChannelEvent)> {
        self.run_tasks();
        self.ctx.events.pop_front()
    }

    /// next I/O instruction for the backend, if any
    pub fn poll_io(&mut self) -> Option<Io> {
        self.run_tasks();
        self.ctx.io.pop_front()
    }

    /// the stream requested by [`Io::Connect`] is established
    pub fn handle_connected(&mut self, conn: ConnectionHandle) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.handle_connected(&mut self.ctx, &self.config);
        }
        self.settle();
    }

    /// the stream requested by [`Io::Connect`] could not be established
    pub fn handle_connect_error(&mut self, conn: ConnectionHandle, reason: &str) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.destroy(
                &mut self.ctx,
                Some(ChannelError::Transport(reason.to_string())),
                None,
            );
        }
        self.settle();
    }

    /// bytes read from a connection's stream
    pub fn handle_input(&mut self, conn: ConnectionHandle, data: &[u8]) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.handle_input(&mut self.ctx, data, &self.config);
        }
        self.settle();
    }

    /// the stream closed or failed
    pub fn handle_disconnected(&mut self, conn: ConnectionHandle, reason: Option<&str>) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.destroy(
                &mut self.ctx,
                Some(ChannelError::Transport(
                    reason.unwrap_or("connection closed by peer").to_string(),
                )),
                None,
            );
        }
        self.settle();
    }

    /// a timer started via [`Io::TimerStart`] expired
    pub fn handle_timeout(&mut self, conn: ConnectionHandle, timer: Timer) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.handle_timeout(&mut self.ctx, timer);
        }
        self.settle();
    }

    /// the connection's stream could not take a full write
    pub fn handle_write_blocked(&mut self, conn: ConnectionHandle) {
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.handle_blocked();
        }
    }

    /// the connection's stream became writable again
    pub fn handle_drained(&mut self, conn: ConnectionHandle) {
        self.run_tasks();
        if let Some(c) = self.connections.get_mut(conn.0) {
            c.handle_drained(&mut self.ctx);
        }
    }

    // ===== internals =====

    fn lookup(&self, handle: ChannelHandle) -> Option<(usize, usize)> {
        let conn = self.connections.get(handle.conn.0)?;
        let ch = conn.channel_ref(handle.chan)?;
        (ch.gen == handle.gen && !ch.destroyed).then_some((handle.conn.0, handle.chan))
    }

    fn get_connection(&mut self, authority: &Authority) -> usize {
        if let Some(&idx) = self.by_authority.get(authority) {
            return idx;
        }
        if let Some(idx) = self.disposed.remove(authority) {
            if let Some(conn) = self.connections.get_mut(idx) {
                conn.revive(&mut self.ctx);
            }
            self.by_authority.insert(authority.clone(), idx);
            return idx;
        }
        let entry = self.connections.vacant_entry();
        let idx = entry.key();
        entry.insert(Connection::new(idx, authority.clone()));
        self.by_authority.insert(authority.clone(), idx);
        debug!(%authority, conn = idx, "dialing new connection");
        self.ctx.io.push_back(Io::Connect {
            connection: ConnectionHandle(idx),
            authority: authority.clone(),
        });
        idx
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.ctx.tasks.pop_front() {
            match task {
                Task::SendOpen { conn, id } => {
                    if let Some(c) = self.connections.get_mut(conn) {
                        c.send_open(&mut self.ctx, id);
                    }
                }
            }
        }
    }

    /// drop dead connections and move idle ones into the disposed map
    fn settle(&mut self) {
        let dead: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_dead())
            .map(|(idx, _)| idx)
            .collect();
        for idx in dead {
            self.connections.remove(idx);
            self.by_authority.retain(|_, &mut v| v != idx);
            self.disposed.retain(|_, &mut v| v != idx);
        }
        let idle: Vec<(Authority, usize)> = self
            .connections
            .iter()
            .filter(|(idx, conn)| {
                conn.lingering && self.by_authority.get(&conn.authority) == Some(idx)
            })
            .map(|(idx, conn)| (conn.authority.clone(), idx))
            .collect();
        for (authority, idx) in idle {
            self.by_authority.remove(&authority);
            self.disposed.insert(authority, idx);
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
