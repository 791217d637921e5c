//! Connections: the protocol-facing side of an endpoint.
//!
//! A connection owns the protocol state for one endpoint for one slice
//! of its lifetime (an upgrade swaps connections without touching the
//! endpoint). The core calls exactly three hooks: `on_open` after the
//! bind, `on_close(cause)` once at the end, and, through the callback
//! the connection registered with `fill_interested`, readable
//! notifications. [`arm_fill_interest`] wires that callback to the
//! [`Fillable`] hooks, which is how implementations express the
//! canonical fill → parse → re-arm loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{Callback, StrandError};

use crate::endpoint::Endpoint;

pub trait Connection: Send + Sync {
    /// Protocol identity ("echo", "http/1.1", ...).
    fn protocol(&self) -> &'static str;

    /// Called once after binding to the endpoint, before any read
    /// interest. Implementations usually arm their first fill here.
    fn on_open(&self);

    /// Final disposition; `None` is a normal close. Called at most once,
    /// before the endpoint releases its resources. Implementations must
    /// release any held buffers.
    fn on_close(&self, cause: Option<&StrandError>);
}

/// Connections driven by readable notifications.
pub trait Fillable: Connection {
    /// The endpoint reported readable. Loop: fill → parse → fill again;
    /// on `Empty` re-arm, on `Eof` close. Express the loop through the
    /// step driver so synchronous write completions stay iterative.
    fn on_fillable(&self);

    /// The registered fill interest failed. Transient causes (idle
    /// timeout) may re-arm; everything else should close.
    fn on_fill_failed(&self, cause: StrandError);
}

/// Register fill interest on `endpoint`, routed to `connection`'s
/// [`Fillable`] hooks.
pub fn arm_fill_interest<C>(endpoint: &dyn Endpoint, connection: &Arc<C>)
where
    C: Fillable + 'static,
{
    let conn = connection.clone();
    endpoint.fill_interested(Callback::new(move |result| match result {
        Ok(()) => conn.on_fillable(),
        Err(cause) => conn.on_fill_failed(cause),
    }));
}

/// Lock-free per-connection accounting: messages and bytes, each way.
#[derive(Debug, Default)]
pub struct Counters {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_in(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_out(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}
