use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{Encoding, Payload};
use crate::client::{ChannelEvent, ChannelHandle, Client, ConnectionHandle, Io, Timer};
use crate::errors::WinkError;
use crate::url::Scheme;
use crate::ClientConfig;

/// socket notifications fed back into the sans-io client
///
/// Every variant carries the connection epoch it was produced under so
/// input from a socket that has since been replaced (handshake redirect)
/// is dropped instead of poisoning the new one.
enum Feed {
    Connected(ConnectionHandle, u64, TcpStream),
    DialFailed(ConnectionHandle, u64, String),
    Data(ConnectionHandle, u64, Vec<u8>),
    Closed(ConnectionHandle, u64, Option<String>),
}

/// tokio TCP backend for [`Client`]
///
/// Dials `Io::Connect` targets with nodelay and keepalive, pumps socket
/// bytes and timer expirations into the client, and yields channel events
/// from [`Driver::next_event`]. Plain TCP only: `https` targets need a
/// host-provided TLS byte stream and are refused here.
pub struct Driver {
    client: Client,
    writers: HashMap<ConnectionHandle, OwnedWriteHalf>,
    readers: HashMap<ConnectionHandle, JoinHandle<()>>,
    epochs: HashMap<ConnectionHandle, u64>,
    timers: HashMap<(ConnectionHandle, Timer), Instant>,
    tx: mpsc::UnboundedSender<Feed>,
    rx: mpsc::UnboundedReceiver<Feed>,
}

impl Driver {
    /// construct a driver with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            client: Client::new(config),
            writers: HashMap::new(),
            readers: HashMap::new(),
            epochs: HashMap::new(),
            timers: HashMap::new(),
            tx,
            rx,
        }
    }

    /// open a channel, see [`Client::open`]
    pub async fn open(&mut self, url: &str, mode: &str) -> Result<ChannelHandle, WinkError> {
        let handle = self.client.open(url, mode)?;
        self.pump().await;
        Ok(handle)
    }

    /// write application data, see [`Client::write`]
    pub async fn write(
        &mut self,
        handle: ChannelHandle,
        payload: Payload,
        priority: u8,
    ) -> Result<bool, WinkError> {
        let flushed = self.client.write(handle, payload, priority)?;
        self.pump().await;
        Ok(flushed)
    }

    /// emit an out-of-band signal, see [`Client::dispatch`]
    pub async fn dispatch(
        &mut self,
        handle: ChannelHandle,
        payload: Payload,
    ) -> Result<bool, WinkError> {
        let flushed = self.client.dispatch(handle, payload)?;
        self.pump().await;
        Ok(flushed)
    }

    /// close a channel, see [`Client::end`]
    pub async fn end(
        &mut self,
        handle: ChannelHandle,
        message: Option<&str>,
    ) -> Result<(), WinkError> {
        self.client.end(handle, message)?;
        self.pump().await;
        Ok(())
    }

    /// set the inbound decoding, see [`Client::set_encoding`]
    pub fn set_encoding(&mut self, handle: ChannelHandle, encoding: Option<Encoding>) {
        self.client.set_encoding(handle, encoding);
    }

    /// the wrapped sans-io client
    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    /// drive sockets and timers until the next channel event
    ///
    /// Returns `None` once nothing is pooled, queued, or pending.
    pub async fn next_event(&mut self) -> Option<(ChannelHandle, ChannelEvent)> {
        loop {
            self.pump().await;
            if let Some(event) = self.client.poll_event() {
                return Some(event);
            }
            if self.client.is_idle() && self.writers.is_empty() && self.timers.is_empty() {
                return None;
            }
            let deadline = self.timers.values().min().copied();
            tokio::select! {
                feed = self.rx.recv() => {
                    if let Some(feed) = feed {
                        self.apply(feed);
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.expire_timers();
                }
            }
        }
    }

    /// execute every pending I/O instruction
    async fn pump(&mut self) {
        while let Some(io) = self.client.poll_io() {
            match io {
                Io::Connect {
                    connection,
                    authority,
                } => {
                    if authority.scheme == Scheme::Https {
                        self.client.handle_connect_error(
                            connection,
                            "https requires a host-provided tls stream",
                        );
                        continue;
                    }
                    let epoch = self.bump_epoch(connection);
                    debug!(%authority, "driver dialing");
                    let tx = self.tx.clone();
                    let host = authority.host.clone();
                    let port = authority.port;
                    tokio::spawn(async move {
                        match dial(&host, port).await {
                            Ok(stream) => {
                                let _ = tx.send(Feed::Connected(connection, epoch, stream));
                            }
                            Err(e) => {
                                let _ =
                                    tx.send(Feed::DialFailed(connection, epoch, e.to_string()));
                            }
                        }
                    });
                }
                Io::Transmit { connection, data } => {
                    let failed = match self.writers.get_mut(&connection) {
                        Some(writer) => writer.write_all(&data).await.err(),
                        None => None,
                    };
                    if let Some(e) = failed {
                        self.drop_socket(connection);
                        self.client
                            .handle_disconnected(connection, Some(&e.to_string()));
                    }
                }
                Io::Close { connection } => {
                    self.bump_epoch(connection);
                    self.drop_socket(connection);
                }
                Io::TimerStart {
                    connection,
                    timer,
                    after,
                } => {
                    self.timers
                        .insert((connection, timer), Instant::now() + after);
                }
                Io::TimerStop { connection, timer } => {
                    self.timers.remove(&(connection, timer));
                }
            }
        }
    }

    fn apply(&mut self, feed: Feed) {
        match feed {
            Feed::Connected(conn, epoch, stream) => {
                if self.epoch(conn) != epoch {
                    return;
                }
                let (read, write) = stream.into_split();
                self.writers.insert(conn, write);
                self.spawn_reader(conn, epoch, read);
                self.client.handle_connected(conn);
            }
            Feed::DialFailed(conn, epoch, reason) => {
                if self.epoch(conn) != epoch {
                    return;
                }
                self.client.handle_connect_error(conn, &reason);
            }
            Feed::Data(conn, epoch, bytes) => {
                if self.epoch(conn) != epoch {
                    return;
                }
                self.client.handle_input(conn, &bytes);
            }
            Feed::Closed(conn, epoch, reason) => {
                if self.epoch(conn) != epoch {
                    return;
                }
                self.drop_socket(conn);
                self.client.handle_disconnected(conn, reason.as_deref());
            }
        }
    }

    fn spawn_reader(&mut self, conn: ConnectionHandle, epoch: u64, mut read: OwnedReadHalf) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match read.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send(Feed::Closed(conn, epoch, None));
                        break;
                    }
                    Ok(n) => {
                        if tx.send(Feed::Data(conn, epoch, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Feed::Closed(conn, epoch, Some(e.to_string())));
                        break;
                    }
                }
            }
        });
        self.readers.insert(conn, handle);
    }

    fn expire_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<(ConnectionHandle, Timer)> = self
            .timers
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&key, _)| key)
            .collect();
        for (conn, timer) in expired {
            self.timers.remove(&(conn, timer));
            self.client.handle_timeout(conn, timer);
        }
    }

    fn drop_socket(&mut self, conn: ConnectionHandle) {
        self.writers.remove(&conn);
        if let Some(reader) = self.readers.remove(&conn) {
            reader.abort();
        }
    }

    fn epoch(&self, conn: ConnectionHandle) -> u64 {
        self.epochs.get(&conn).copied().unwrap_or(0)
    }

    fn bump_epoch(&mut self, conn: ConnectionHandle) -> u64 {
        let epoch = self.epochs.entry(conn).or_insert(0);
        *epoch += 1;
        *epoch
    }
}

async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve")))
}
