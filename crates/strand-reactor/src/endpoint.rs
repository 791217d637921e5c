//! Endpoints: non-blocking read/write with callback completion.
//!
//! A `SocketEndpoint` is the exclusive owner of one channel. Each
//! direction is a tiny state machine:
//!
//! - read: `Idle → Interested` on `fill_interested`, back to `Idle` when
//!   the callback fires (readable) or fails (close/error/timeout). The
//!   interest is single-shot; readiness arriving while idle is benign
//!   and only marks the cached readiness bit.
//! - write: `Idle → Pending{buffers, callback}` on a write the OS did
//!   not fully accept; the flusher absorbs partial progress and the
//!   callback fires exactly once when everything is transmitted.
//!
//! Channels are registered edge-triggered for read|write once, at
//! adoption. Read readiness is cached per endpoint, under the endpoint
//! lock so it serializes against `fill`: a `fill_interested` arriving
//! after readiness already fired completes immediately, and a readable
//! edge landing while `fill` drains to `WouldBlock` is ordered after the
//! clear and stays visible. Write readiness needs no cache: the flusher
//! state and the writable dispatch meet under the same lock. This
//! replaces per-event interest mutation entirely; the selector's action
//! queue carries only registration, removal, deadlines and custom tasks.
//!
//! Locking discipline: callbacks and connection hooks are never invoked
//! while the endpoint lock is held, because completions may be
//! synchronous and may re-enter the endpoint.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use mio::Token;

use strand_core::{Callback, Result, StrandError};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::listener::Listeners;
use crate::selector::{Action, SelectorHandle};

/// Outcome of one non-blocking fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes appended to the buffer.
    Data(usize),
    /// No data right now; re-arm read interest.
    Empty,
    /// Peer closed its write side.
    Eof,
}

/// The channel-facing abstraction handed to connections.
pub trait Endpoint: Send + Sync {
    /// Declare single-shot interest in "readable". Exactly one
    /// `succeeded` per arm; `failed` on close, error or idle timeout.
    /// A second registration while one is outstanding fails the new
    /// callback immediately.
    fn fill_interested(&self, callback: Callback);

    /// Non-blocking read appending to `buf`'s spare capacity.
    fn fill(&self, buf: &mut BytesMut) -> Result<Fill>;

    /// Non-blocking gather write. One outstanding write at a time; the
    /// callback fires exactly once when every byte is transmitted.
    fn write(&self, callback: Callback, buffers: Vec<Bytes>);

    /// Shut down the write side; pending and later writes fail.
    fn shutdown_output(&self);

    /// Idempotent terminal transition; fails all pending callbacks.
    fn close(&self) {
        self.close_with(None);
    }
    fn close_with(&self, cause: Option<StrandError>);

    fn is_open(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn created_at(&self) -> Instant;

    fn idle_timeout(&self) -> Option<Duration>;
    fn set_idle_timeout(&self, timeout: Option<Duration>);

    fn connection(&self) -> Option<Arc<dyn Connection>>;

    /// Bind the first connection: fires the `opened` listeners and
    /// `on_open`.
    fn bind(&self, connection: Arc<dyn Connection>);

    /// Atomically replace the bound connection. Pending read interest is
    /// cleared (the callback is dropped, never fired); the outgoing
    /// connection gets `on_close(None)`, the incoming `on_open`.
    fn upgrade(&self, connection: Arc<dyn Connection>);

    // Selector-facing surface below. Embedders do not call these.

    /// Readiness dispatch from the selector: `on-readable` first, then
    /// `on-writable`.
    fn on_selected(&self, readable: bool, writable: bool);

    /// Deadline expiry check. Fires pending callbacks with a transient
    /// timeout when the endpoint has been idle past its timeout, and
    /// returns the next deadline to schedule (`None` when closed or no
    /// timeout is configured).
    fn on_deadline(&self, now: Instant) -> Option<Instant>;
}

struct FillInterest {
    callback: Option<Callback>,
}

enum WriteFlusher {
    Idle,
    Pending {
        buffers: VecDeque<Bytes>,
        callback: Callback,
    },
}

struct Inner {
    channel: Option<Box<dyn Channel>>,
    fill: FillInterest,
    flusher: WriteFlusher,
    /// Readable edge seen and not yet drained to `WouldBlock`.
    read_ready: bool,
    connection: Option<Arc<dyn Connection>>,
    idle_timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
    idle_rearmed: Instant,
    output_shutdown: bool,
    input_eof: bool,
    closed: Option<StrandError>,
}

pub struct SocketEndpoint {
    token: Token,
    selector: SelectorHandle,
    listeners: Arc<Listeners>,
    created: Instant,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    open: AtomicBool,
    inner: Mutex<Inner>,
}

impl SocketEndpoint {
    pub fn new(
        channel: Box<dyn Channel>,
        token: Token,
        selector: SelectorHandle,
        listeners: Arc<Listeners>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let local = channel.local_addr().ok();
        let remote = channel.peer_addr().ok();
        Arc::new(Self {
            token,
            selector,
            listeners,
            created: now,
            local,
            remote,
            open: AtomicBool::new(true),
            inner: Mutex::new(Inner {
                channel: Some(channel),
                fill: FillInterest { callback: None },
                flusher: WriteFlusher::Idle,
                read_ready: false,
                connection: None,
                idle_timeout,
                last_read: now,
                last_write: now,
                idle_rearmed: now,
                output_shutdown: false,
                input_eof: false,
                closed: None,
            }),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Gather-write as much of `buffers` as the OS accepts right now.
    /// `Ok(true)` when fully drained.
    fn flush(channel: &mut dyn Channel, buffers: &mut VecDeque<Bytes>) -> io::Result<bool> {
        loop {
            while matches!(buffers.front(), Some(b) if b.is_empty()) {
                buffers.pop_front();
            }
            if buffers.is_empty() {
                return Ok(true);
            }

            let slices: Vec<IoSlice<'_>> =
                buffers.iter().map(|b| IoSlice::new(b)).collect();
            match channel.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(mut n) => {
                    while n > 0 {
                        let front = buffers.front_mut().expect("accounting");
                        let take = n.min(front.len());
                        front.advance(take);
                        n -= take;
                        if front.is_empty() {
                            buffers.pop_front();
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Continue a pending flush after a writable notification.
    fn on_writable(&self) {
        let done: Option<(Callback, Result<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return;
            }
            match std::mem::replace(&mut inner.flusher, WriteFlusher::Idle) {
                WriteFlusher::Idle => None,
                WriteFlusher::Pending {
                    mut buffers,
                    callback,
                } => {
                    let Inner { channel, .. } = &mut *inner;
                    let channel = channel.as_deref_mut().expect("open endpoint has channel");
                    match Self::flush(channel, &mut buffers) {
                        Ok(true) => {
                            inner.last_write = Instant::now();
                            Some((callback, Ok(())))
                        }
                        Ok(false) => {
                            inner.last_write = Instant::now();
                            inner.flusher = WriteFlusher::Pending { buffers, callback };
                            None
                        }
                        Err(e) => Some((callback, Err(e.into()))),
                    }
                }
            }
        };

        if let Some((callback, result)) = done {
            log::trace!("endpoint {:?} write flushed: {:?}", self.token, result);
            callback.complete(result);
        }
    }

    fn on_readable(&self) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            inner.read_ready = true;
            inner.fill.callback.take()
        };
        if let Some(callback) = callback {
            callback.succeeded();
        }
    }
}

impl Endpoint for SocketEndpoint {
    fn fill_interested(&self, callback: Callback) {
        enum Disposition {
            Ready,
            Stored,
            Rejected(StrandError),
        }

        let mut callback = Some(callback);
        let disposition = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cause) = &inner.closed {
                Disposition::Rejected(cause.clone())
            } else if inner.fill.callback.is_some() {
                Disposition::Rejected(StrandError::Usage("fill interest pending"))
            } else if inner.read_ready || inner.input_eof {
                Disposition::Ready
            } else {
                inner.fill.callback = callback.take();
                Disposition::Stored
            }
        };

        match disposition {
            Disposition::Ready => callback.take().expect("unconsumed").succeeded(),
            Disposition::Stored => {}
            Disposition::Rejected(cause) => {
                if matches!(cause, StrandError::Usage(_)) {
                    log::warn!("endpoint {:?}: {}", self.token, cause);
                }
                callback.take().expect("unconsumed").failed(cause);
            }
        }
    }

    fn fill(&self, buf: &mut BytesMut) -> Result<Fill> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.input_eof {
            return Ok(Fill::Eof);
        }
        if buf.spare_capacity_mut().is_empty() {
            // A full buffer cannot absorb readable data; growing here
            // beats returning Empty and spinning on the readiness bit.
            buf.reserve(1024);
        }

        let outcome = {
            let channel = inner.channel.as_deref_mut().expect("open endpoint has channel");
            loop {
                let spare = buf.spare_capacity_mut();
                // Safety: the channel only writes into the slice; set_len
                // below claims exactly the bytes it reported.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(spare.as_mut_ptr().cast::<u8>(), spare.len())
                };
                match channel.read(dst) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            }
        };

        match outcome {
            Ok(0) => {
                inner.input_eof = true;
                Ok(Fill::Eof)
            }
            Ok(n) => {
                // Safety: n bytes were initialized by the read above.
                unsafe { buf.set_len(buf.len() + n) };
                inner.last_read = Instant::now();
                Ok(Fill::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                inner.read_ready = false;
                Ok(Fill::Empty)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, callback: Callback, buffers: Vec<Bytes>) {
        let done: Option<(Callback, Result<()>)> = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cause) = &inner.closed {
                Some((callback, Err(cause.clone())))
            } else if inner.output_shutdown {
                Some((callback, Err(StrandError::Closed)))
            } else if matches!(inner.flusher, WriteFlusher::Pending { .. }) {
                log::warn!("endpoint {:?}: write pending", self.token);
                Some((callback, Err(StrandError::Usage("write pending"))))
            } else {
                let mut queue: VecDeque<Bytes> =
                    buffers.into_iter().filter(|b| !b.is_empty()).collect();
                let Inner { channel, .. } = &mut *inner;
                let channel = channel.as_deref_mut().expect("open endpoint has channel");
                match Self::flush(channel, &mut queue) {
                    Ok(true) => {
                        inner.last_write = Instant::now();
                        Some((callback, Ok(())))
                    }
                    Ok(false) => {
                        inner.last_write = Instant::now();
                        inner.flusher = WriteFlusher::Pending {
                            buffers: queue,
                            callback,
                        };
                        None
                    }
                    Err(e) => Some((callback, Err(e.into()))),
                }
            }
        };

        if let Some((callback, result)) = done {
            callback.complete(result);
        }
    }

    fn shutdown_output(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.is_some() || inner.output_shutdown {
            return;
        }
        inner.output_shutdown = true;
        if let Some(channel) = inner.channel.as_deref_mut() {
            if let Err(e) = channel.shutdown_output() {
                log::debug!("endpoint {:?} shutdown_output: {}", self.token, e);
            }
        }
    }

    fn close_with(&self, cause: Option<StrandError>) {
        let (fill_cb, write_cb, connection, error) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return;
            }
            let error = cause.clone().unwrap_or(StrandError::Closed);
            inner.closed = Some(error.clone());
            // Dropping the channel closes the descriptor, which also
            // removes it from the selector.
            inner.channel = None;

            let fill_cb = inner.fill.callback.take();
            let write_cb = match std::mem::replace(&mut inner.flusher, WriteFlusher::Idle) {
                WriteFlusher::Idle => None,
                WriteFlusher::Pending { callback, .. } => Some(callback),
            };
            (fill_cb, write_cb, inner.connection.take(), error)
        };

        self.open.store(false, Ordering::Release);
        log::debug!("endpoint {:?} closed: {}", self.token, error);

        if let Some(cb) = fill_cb {
            cb.failed(error.clone());
        }
        if let Some(cb) = write_cb {
            cb.failed(error);
        }
        if let Some(connection) = connection {
            connection.on_close(cause.as_ref());
            self.listeners.closed(&connection);
        }

        self.selector.submit(Action::Remove(self.token));
        self.selector.wake();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn created_at(&self) -> Instant {
        self.created
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.inner.lock().unwrap().idle_timeout
    }

    fn set_idle_timeout(&self, timeout: Option<Duration>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.idle_timeout = timeout;
        }
        if let Some(timeout) = timeout {
            self.selector.submit(Action::Deadline {
                token: self.token,
                at: Instant::now() + timeout,
            });
            self.selector.wake();
        }
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.lock().unwrap().connection.clone()
    }

    fn bind(&self, connection: Arc<dyn Connection>) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.connection.is_none(), "bind over live connection");
            inner.connection = Some(connection.clone());
        }
        self.listeners.opened(&connection);
        connection.on_open();
    }

    fn upgrade(&self, connection: Arc<dyn Connection>) {
        let outgoing = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                log::warn!("endpoint {:?}: upgrade after close", self.token);
                return;
            }
            // Pending read interest does not survive the swap.
            inner.fill.callback = None;
            inner.connection.replace(connection.clone())
        };

        if let Some(outgoing) = outgoing {
            log::debug!(
                "endpoint {:?} upgrade {} -> {}",
                self.token,
                outgoing.protocol(),
                connection.protocol()
            );
            outgoing.on_close(None);
            self.listeners.closed(&outgoing);
        }
        self.listeners.opened(&connection);
        connection.on_open();
    }

    fn on_selected(&self, readable: bool, writable: bool) {
        if readable {
            self.on_readable();
        }
        if writable {
            self.on_writable();
        }
    }

    fn on_deadline(&self, now: Instant) -> Option<Instant> {
        let (fill_cb, write_cb, next) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed.is_some() {
                return None;
            }
            let timeout = inner.idle_timeout?;
            let idle_since = inner.last_read.max(inner.last_write).max(inner.idle_rearmed);
            let deadline = idle_since + timeout;
            if now < deadline {
                return Some(deadline);
            }

            let fill_cb = inner.fill.callback.take();
            let write_cb = match std::mem::replace(&mut inner.flusher, WriteFlusher::Idle) {
                WriteFlusher::Idle => None,
                WriteFlusher::Pending { callback, .. } => Some(callback),
            };
            // Re-arm whether or not anything fired; the connection may
            // keep the endpoint open after a transient timeout.
            inner.idle_rearmed = now;
            (fill_cb, write_cb, Some(now + timeout))
        };

        if fill_cb.is_some() || write_cb.is_some() {
            log::debug!("endpoint {:?} idle timeout", self.token);
        }
        if let Some(cb) = fill_cb {
            cb.failed(StrandError::Timeout);
        }
        if let Some(cb) = write_cb {
            cb.failed(StrandError::Timeout);
        }
        next
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        // Normal teardown goes through close_with; this is the backstop
        // for endpoints dropped without a connection ever binding.
        if self.open.load(Ordering::Relaxed) {
            log::debug!("endpoint {:?} dropped while open", self.token);
        }
    }
}

impl std::fmt::Debug for SocketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEndpoint")
            .field("token", &self.token)
            .field("open", &self.is_open())
            .field("remote", &self.remote)
            .finish()
    }
}
