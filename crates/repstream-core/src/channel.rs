//! Message transports
//!
//! A [`Channel`] moves framed [`Message`]s between a feeder and a consumer.
//! All methods take `&self` so one side can read and write from different
//! threads through an `Arc<dyn Channel>`.

use crate::protocol::{ProtocolContext, ProtocolStats, codec};
use crate::protocol::Message;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::{Mutex, RwLock};
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

const READ_CHUNK: usize = 8 * 1024;

/// Bidirectional message transport
pub trait Channel: Send + Sync {
    /// Encode and send one message with the current context
    fn send(&self, message: &Message) -> Result<()>;

    /// Wait up to `wait` for the next message; `Ok(None)` on timeout
    fn receive(&self, wait: Duration) -> Result<Option<Message>>;

    /// Whether both directions are still usable
    fn is_open(&self) -> bool;

    /// Close both directions; idempotent
    fn close(&self);

    /// Context used for encode and decode
    fn context(&self) -> ProtocolContext;

    /// Replace the context, typically once after the handshake
    fn set_context(&self, ctx: ProtocolContext);

    /// Name of the node on the other end
    fn peer_name(&self) -> String;

    /// Message counters
    fn stats(&self) -> &ProtocolStats;
}

fn closed(peer: &str) -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::ConnectionAborted,
        format!("channel to {} is closed", peer),
    ))
}

/// In-process channel; every message crosses the codec
pub struct MemoryChannel {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    open: Arc<AtomicBool>,
    close_tx: Arc<Mutex<Option<Sender<()>>>>,
    close_rx: Receiver<()>,
    ctx: RwLock<ProtocolContext>,
    peer_name: String,
    stats: ProtocolStats,
}

impl MemoryChannel {
    /// Connected pair; `a` talks to a peer named `b_name` and vice versa
    pub fn pair(a_name: &str, b_name: &str) -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        let open = Arc::new(AtomicBool::new(true));
        let close_tx = Arc::new(Mutex::new(Some(close_tx)));

        let a = Self {
            tx: a_tx,
            rx: a_rx,
            open: open.clone(),
            close_tx: close_tx.clone(),
            close_rx: close_rx.clone(),
            ctx: RwLock::new(ProtocolContext::handshake()),
            peer_name: b_name.to_string(),
            stats: ProtocolStats::new(),
        };
        let b = Self {
            tx: b_tx,
            rx: b_rx,
            open,
            close_tx,
            close_rx,
            ctx: RwLock::new(ProtocolContext::handshake()),
            peer_name: a_name.to_string(),
            stats: ProtocolStats::new(),
        };
        (a, b)
    }

    fn decode(&self, frame: Bytes) -> Result<Message> {
        let message = codec::decode_frame(&frame, &self.ctx.read())?;
        self.stats.record_read(&message, frame.len());
        Ok(message)
    }
}

impl Channel for MemoryChannel {
    fn send(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(closed(&self.peer_name));
        }
        let frame = codec::encode_frame(message, &self.ctx.read())?;
        let len = frame.len();
        self.tx.send(frame).map_err(|_| closed(&self.peer_name))?;
        self.stats.record_write(message, len);
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Message>> {
        // Frames sent before a close are still delivered.
        if let Ok(frame) = self.rx.try_recv() {
            return self.decode(frame).map(Some);
        }
        if !self.is_open() {
            return Err(closed(&self.peer_name));
        }
        select! {
            recv(self.rx) -> frame => match frame {
                Ok(frame) => self.decode(frame).map(Some),
                Err(_) => Err(closed(&self.peer_name)),
            },
            recv(self.close_rx) -> _ => match self.rx.try_recv() {
                Ok(frame) => self.decode(frame).map(Some),
                Err(_) => Err(closed(&self.peer_name)),
            },
            default(wait) => Ok(None),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        // Dropping the sender wakes receivers blocked in select.
        self.close_tx.lock().take();
    }

    fn context(&self) -> ProtocolContext {
        *self.ctx.read()
    }

    fn set_context(&self, ctx: ProtocolContext) {
        *self.ctx.write() = ctx;
    }

    fn peer_name(&self) -> String {
        self.peer_name.clone()
    }

    fn stats(&self) -> &ProtocolStats {
        &self.stats
    }
}

/// TCP channel over tokio sockets.
///
/// Sessions run on plain threads, so each channel owns a small runtime and
/// every call blocks on it. Reads go through a reassembly buffer, which
/// keeps a read cut short by its deadline from losing bytes.
pub struct TcpChannel {
    reader: Mutex<(OwnedReadHalf, BytesMut)>,
    writer: Mutex<OwnedWriteHalf>,
    closing: Notify,
    open: AtomicBool,
    ctx: RwLock<ProtocolContext>,
    peer_name: String,
    stats: ProtocolStats,
    // Dropped after the socket halves that are registered with it.
    runtime: Runtime,
}

impl TcpChannel {
    /// Wrap a connected stream
    pub fn new(stream: std::net::TcpStream, peer_name: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("repstream-tcp")
            .enable_all()
            .build()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let stream = {
            let _enter = runtime.enter();
            TcpStream::from_std(stream)?
        };
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new((reader, BytesMut::with_capacity(READ_CHUNK))),
            writer: Mutex::new(writer),
            closing: Notify::new(),
            open: AtomicBool::new(true),
            ctx: RwLock::new(ProtocolContext::handshake()),
            peer_name: peer_name.into(),
            stats: ProtocolStats::new(),
            runtime,
        })
    }

    /// Connect to a peer
    pub fn connect(addr: impl ToSocketAddrs, peer_name: impl Into<String>) -> Result<Self> {
        let stream = std::net::TcpStream::connect(addr)?;
        Self::new(stream, peer_name)
    }

    fn pop_frame(&self, buf: &mut BytesMut, ctx: &ProtocolContext) -> Result<Option<Message>> {
        let before = buf.len();
        let message = codec::try_decode(buf, ctx)?;
        if let Some(message) = &message {
            self.stats.record_read(message, before - buf.len());
        }
        Ok(message)
    }

    /// Read until a frame completes, the deadline passes or the channel closes.
    ///
    /// The socket is polled at least once, so a zero wait still picks up
    /// bytes that have already arrived.
    async fn read_frame(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        ctx: &ProtocolContext,
        deadline: tokio::time::Instant,
    ) -> Result<Option<Message>> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if !self.is_open() {
            return Err(closed(&self.peer_name));
        }
        loop {
            buf.reserve(READ_CHUNK);
            tokio::select! {
                biased;
                read = tokio::time::timeout_at(deadline, reader.read_buf(buf)) => match read {
                    Err(_) => return Ok(None),
                    Ok(Ok(0)) => {
                        self.open.store(false, Ordering::Release);
                        return Err(closed(&self.peer_name));
                    }
                    Ok(Ok(_)) => {
                        if let Some(message) = self.pop_frame(buf, ctx)? {
                            return Ok(Some(message));
                        }
                    }
                    Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => {}
                    Ok(Err(e)) => return Err(e.into()),
                },
                _ = &mut closing => return Err(closed(&self.peer_name)),
            }
        }
    }
}

impl Channel for TcpChannel {
    fn send(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(closed(&self.peer_name));
        }
        let ctx = *self.ctx.read();
        let mut writer = self.writer.lock();
        let len = self
            .runtime
            .block_on(codec::write_message_async(&mut *writer, message, &ctx))?;
        self.stats.record_write(message, len);
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Message>> {
        let ctx = *self.ctx.read();
        let mut guard = self.reader.lock();
        let (reader, buf) = &mut *guard;
        if let Some(message) = self.pop_frame(buf, &ctx)? {
            return Ok(Some(message));
        }
        let deadline = tokio::time::Instant::now() + wait;
        self.runtime
            .block_on(self.read_frame(reader, buf, &ctx, deadline))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closing.notify_waiters();
            let mut writer = self.writer.lock();
            let _ = self.runtime.block_on(writer.shutdown());
        }
    }

    fn context(&self) -> ProtocolContext {
        *self.ctx.read()
    }

    fn set_context(&self, ctx: ProtocolContext) {
        *self.ctx.write() = ctx;
    }

    fn peer_name(&self) -> String {
        self.peer_name.clone()
    }

    fn stats(&self) -> &ProtocolStats {
        &self.stats
    }
}

/// Connected loopback pair, each side named after its peer
#[cfg(test)]
pub(crate) fn tcp_pair(a_name: &str, b_name: &str) -> (TcpChannel, TcpChannel) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let b = TcpChannel::connect(listener.local_addr().unwrap(), a_name).unwrap();
    let (stream, _) = listener.accept().unwrap();
    let a = TcpChannel::new(stream, b_name).unwrap();
    (a, b)
}
