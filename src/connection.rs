//! A line-oriented, timer-guarded connection.
//!
//! [`Connection`] owns one accepted socket and turns socket readiness and
//! timer expiry into four events: [`ConnEvent::Connected`],
//! [`ConnEvent::Data`] (one line), [`ConnEvent::Closed`] and
//! [`ConnEvent::Timeout`]. Protocol sessions never touch the socket; every
//! callback gets a [`Link`] through which it queues writes, requests a close
//! or asks for a STARTTLS upgrade. The connection's task applies those
//! requests between events.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::signals::{EventHub, EventKind};
use crate::timer::{self, InactivityTimer};

/// Bytes requested from the socket per readiness notification.
const READ_CHUNK: usize = 4096;

/// Largest amount of unterminated input we keep around.
pub const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Upper bound on the graceful shutdown (TLS close_notify) at close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnEvent {
    Connected,
    Data,
    Closed,
    Timeout,
}

impl EventKind for ConnEvent {
    const ALL: &'static [Self] = &[
        ConnEvent::Connected,
        ConnEvent::Data,
        ConnEvent::Closed,
        ConnEvent::Timeout,
    ];

    fn name(self) -> &'static str {
        match self {
            ConnEvent::Connected => "connected",
            ConnEvent::Data => "data",
            ConnEvent::Closed => "closed",
            ConnEvent::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connected,
}

/// Runs once its buffer has been written out and flushed.
pub type Completion = Box<dyn FnOnce(&mut Link) -> anyhow::Result<()> + Send>;

struct Pending {
    bytes: Vec<u8>,
    written: usize,
    then: Option<Completion>,
}

impl Pending {
    fn remaining(&self) -> &[u8] {
        &self.bytes[self.written..]
    }

    fn is_done(&self) -> bool {
        self.written >= self.bytes.len()
    }
}

/// Plain TCP before STARTTLS, rustls afterwards. Same socket either way.
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The part of a connection that event callbacks may act on.
pub struct Link {
    peer: SocketAddr,
    state: TransportState,
    encrypted: bool,
    pending: VecDeque<Pending>,
    closing: bool,
    upgrade: Option<Arc<TlsAcceptor>>,
    timer: InactivityTimer,
}

impl Link {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            peer: SocketAddr::from(([0, 0, 0, 0], 0)),
            state: TransportState::Closed,
            encrypted: false,
            pending: VecDeque::new(),
            closing: false,
            upgrade: None,
            timer: InactivityTimer::new(timeout),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Queue `data` and push the inactivity deadline out.
    pub fn write(&mut self, data: impl Into<Vec<u8>>) {
        self.enqueue(data.into(), true, None);
    }

    /// Queue `data`; `then` runs once these bytes have left the process.
    pub fn write_then<F>(&mut self, data: impl Into<Vec<u8>>, rearm: bool, then: F)
    where
        F: FnOnce(&mut Link) -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(data.into(), rearm, Some(Box::new(then)));
    }

    /// Queue a final reply and close once it has been flushed.
    pub fn write_and_close(&mut self, data: impl Into<Vec<u8>>) {
        self.write_then(data, false, |link| {
            link.close();
            Ok(())
        });
    }

    /// Ask for a TLS upgrade over the current socket. The handshake starts
    /// once the write queue is empty, so call this from a write completion.
    pub fn start_tls(&mut self, acceptor: Arc<TlsAcceptor>) -> anyhow::Result<()> {
        if self.state != TransportState::Connected {
            bail!("cannot start TLS on a closed connection");
        }
        if self.encrypted || self.upgrade.is_some() {
            bail!("TLS already active");
        }
        self.upgrade = Some(acceptor);
        Ok(())
    }

    /// Close without flushing. Anything still queued is dropped.
    pub fn close(&mut self) {
        if self.state == TransportState::Connected {
            self.closing = true;
        }
        self.pending.clear();
        self.upgrade = None;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Bytes queued but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|p| p.remaining().len()).sum()
    }

    fn enqueue(&mut self, bytes: Vec<u8>, rearm: bool, then: Option<Completion>) {
        if self.state != TransportState::Connected || self.closing {
            debug!(peer = %self.peer, len = bytes.len(), "dropping write on closed connection");
            return;
        }
        self.pending.push_back(Pending {
            bytes,
            written: 0,
            then,
        });
        if rearm {
            self.timer.rearm();
        }
    }
}

#[cfg(test)]
impl Link {
    /// A connected link with no socket behind it.
    pub(crate) fn detached() -> Self {
        let mut link = Link::new(None);
        link.state = TransportState::Connected;
        link
    }

    /// Pretend every queued buffer was written: concatenate them and run
    /// their completions.
    pub(crate) fn flush_detached(&mut self) -> String {
        let mut out = Vec::new();
        while let Some(pending) = self.pending.pop_front() {
            out.extend_from_slice(&pending.bytes);
            if let Some(then) = pending.then {
                then(self).unwrap();
            }
        }
        String::from_utf8(out).unwrap()
    }

    pub(crate) fn upgrade_requested(&self) -> bool {
        self.upgrade.is_some()
    }

    pub(crate) fn set_encrypted(&mut self) {
        self.upgrade = None;
        self.encrypted = true;
    }
}

pub struct Connection {
    link: Link,
    transport: Option<Transport>,
    read_buf: Vec<u8>,
    hub: EventHub<ConnEvent, Link, [u8]>,
}

impl Connection {
    /// A closed connection; `timeout` of `None` disables the inactivity timer.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            link: Link::new(timeout),
            transport: None,
            read_buf: Vec::new(),
            hub: EventHub::new(),
        }
    }

    pub fn on<F>(&mut self, kind: ConnEvent, callback: F)
    where
        F: FnMut(&mut Link, &[u8]) -> anyhow::Result<()> + Send + 'static,
    {
        self.hub.on(kind, callback);
    }

    pub fn prepend<F>(&mut self, kind: ConnEvent, callback: F)
    where
        F: FnMut(&mut Link, &[u8]) -> anyhow::Result<()> + Send + 'static,
    {
        self.hub.prepend(kind, callback);
    }

    pub fn state(&self) -> TransportState {
        self.link.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer
    }

    pub fn is_encrypted(&self) -> bool {
        self.link.encrypted
    }

    pub fn link(&mut self) -> &mut Link {
        &mut self.link
    }

    /// Bind the accepted socket, arm the timer and fire `connected`.
    pub fn connect(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.link.state == TransportState::Connected {
            warn!(peer = %peer, "connect called on an open connection, ignoring");
            return;
        }
        info!(peer = %peer, "connection opened");
        self.link.peer = peer;
        self.link.state = TransportState::Connected;
        self.transport = Some(Transport::Plain(stream));
        self.link.timer.rearm();
        self.fire(ConnEvent::Connected, &[]);
    }

    /// Drive the connection until it is closed.
    pub async fn run(mut self) {
        while self.link.state == TransportState::Connected {
            if self.link.closing {
                self.shutdown().await;
            } else if let Some(acceptor) = self.link.upgrade.take() {
                self.upgrade(acceptor).await;
            } else if !self.link.pending.is_empty() {
                self.drain_once().await;
            } else if !self.dispatch_line() {
                self.read_once().await;
            }
        }
    }

    /// Tear the connection down now. Safe to call any number of times;
    /// `closed` fires only on the first.
    pub fn close(&mut self) {
        if self.link.state == TransportState::Closed {
            return;
        }
        self.link.state = TransportState::Closed;
        self.link.closing = false;
        self.link.timer.cancel();
        self.link.pending.clear();
        self.link.upgrade = None;
        self.transport = None;
        self.read_buf.clear();
        self.fire(ConnEvent::Closed, &[]);
        info!(peer = %self.link.peer, "connection closed");
    }

    fn fire(&mut self, kind: ConnEvent, args: &[u8]) {
        if let Err(e) = self.hub.fire(kind, &mut self.link, args) {
            warn!(peer = %self.link.peer, event = kind.name(), "callback failed: {e:#}");
            self.close();
        }
    }

    /// Fire `timeout` once. Whatever the callbacks queue in response gets
    /// [`SHUTDOWN_GRACE`] to drain; a peer that stops reading is cut off
    /// when that runs out.
    fn expire(&mut self) {
        if self.link.timer.is_final() {
            warn!(peer = %self.link.peer, "final flush timed out");
            self.close();
            return;
        }
        debug!(peer = %self.link.peer, "inactivity timeout");
        self.link.timer.cancel();
        self.fire(ConnEvent::Timeout, &[]);
        if self.link.state == TransportState::Connected && !self.link.pending.is_empty() {
            self.link.timer.finish_within(SHUTDOWN_GRACE);
        }
    }

    fn fail(&mut self, what: &str, err: io::Error) {
        warn!(peer = %self.link.peer, "{what} failed: {err}");
        self.close();
    }

    /// Deliver one buffered line, if there is a complete one. The run loop
    /// only gets here with an empty write queue, so any completion queued by
    /// the previous line (a STARTTLS upgrade) has already run.
    fn dispatch_line(&mut self) -> bool {
        let Some(end) = self.read_buf.iter().position(|b| *b == b'\n') else {
            return false;
        };
        let mut line: Vec<u8> = self.read_buf.drain(..=end).collect();
        line.pop();
        self.link.timer.rearm();
        self.fire(ConnEvent::Data, &line);
        true
    }

    async fn read_once(&mut self) {
        let deadline = self.link.timer.deadline();
        let mut chunk = [0u8; READ_CHUNK];
        let outcome = match self.transport.as_mut() {
            Some(transport) => tokio::select! {
                res = transport.read(&mut chunk) => Some(res),
                _ = timer::expiry(deadline) => None,
            },
            None => Some(Err(io::ErrorKind::NotConnected.into())),
        };
        match outcome {
            None => self.expire(),
            Some(Ok(0)) => {
                debug!(peer = %self.link.peer, "peer closed the connection");
                self.close();
            }
            Some(Ok(n)) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                if self.read_buf.len() > MAX_LINE_BUFFER && !self.read_buf.contains(&b'\n') {
                    self.fail(
                        "read",
                        io::Error::new(io::ErrorKind::InvalidData, "line too long"),
                    );
                }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Some(Err(e)) => self.fail("read", e),
        }
    }

    async fn drain_once(&mut self) {
        if self.transport.is_none() {
            self.close();
            return;
        }
        let deadline = self.link.timer.deadline();
        let outcome = {
            let (Some(transport), Some(head)) =
                (self.transport.as_mut(), self.link.pending.front_mut())
            else {
                return;
            };
            tokio::select! {
                res = write_some(transport, head) => Some(res),
                _ = timer::expiry(deadline) => None,
            }
        };
        match outcome {
            None => self.expire(),
            Some(Ok(false)) => {}
            Some(Ok(true)) => {
                let Some(done) = self.link.pending.pop_front() else {
                    return;
                };
                if self.link.pending.is_empty() && self.link.timer.is_final() {
                    self.link.timer.cancel();
                }
                if let Some(then) = done.then {
                    if let Err(e) = then(&mut self.link) {
                        warn!(peer = %self.link.peer, "write completion failed: {e:#}");
                        self.close();
                    }
                }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Some(Err(e)) => self.fail("write", e),
        }
    }

    async fn upgrade(&mut self, acceptor: Arc<TlsAcceptor>) {
        let stream = match self.transport.take() {
            Some(Transport::Plain(stream)) => stream,
            other => {
                self.transport = other;
                warn!(peer = %self.link.peer, "TLS upgrade requested on a non-plain transport");
                self.close();
                return;
            }
        };
        if !self.read_buf.is_empty() {
            debug!(
                peer = %self.link.peer,
                len = self.read_buf.len(),
                "discarding plaintext received before TLS handshake"
            );
            self.read_buf.clear();
        }

        debug!(peer = %self.link.peer, "starting TLS handshake");
        let deadline = self.link.timer.deadline();
        let outcome = tokio::select! {
            res = acceptor.accept(stream) => Some(res),
            _ = timer::expiry(deadline) => None,
        };
        match outcome {
            Some(Ok(tls)) => {
                self.transport = Some(Transport::Tls(Box::new(tls)));
                self.link.encrypted = true;
                self.link.timer.rearm();
                info!(peer = %self.link.peer, "TLS session established");
            }
            Some(Err(e)) => self.fail("TLS handshake", e),
            None => {
                warn!(peer = %self.link.peer, "TLS handshake timed out");
                self.close();
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_GRACE, transport.shutdown()).await {
                debug!(peer = %self.link.peer, "shutdown: {e}");
            }
        }
        self.close();
    }
}

/// Write as much of `head` as the socket takes. `Ok(true)` once it is fully
/// written and flushed.
async fn write_some(transport: &mut Transport, head: &mut Pending) -> io::Result<bool> {
    if !head.is_done() {
        let n = transport.write(head.remaining()).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        head.written += n;
        if !head.is_done() {
            return Ok(false);
        }
    }
    transport.flush().await?;
    Ok(true)
}
