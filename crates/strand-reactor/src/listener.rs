//! Connection lifecycle listeners.
//!
//! Components subscribe to `opened`/`closed` globally (statistics,
//! connection limits). Invocation is synchronous within the lifecycle
//! transition: `opened` strictly precedes the connection's first
//! readable notification and `closed` strictly follows `on_close`.
//! Listeners are contractually non-blocking; a panicking listener is
//! caught, logged and isolated from other listeners and from the
//! connection itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

pub trait ConnectionListener: Send + Sync {
    fn opened(&self, connection: &Arc<dyn Connection>);
    fn closed(&self, connection: &Arc<dyn Connection>);
}

/// Listener registry shared by a selector manager and its endpoints.
#[derive(Default)]
pub struct Listeners {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn opened(&self, connection: &Arc<dyn Connection>) {
        for listener in self.listeners.read().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.opened(connection))).is_err() {
                log::warn!(
                    "connection listener panicked in opened({})",
                    connection.protocol()
                );
            }
        }
    }

    pub fn closed(&self, connection: &Arc<dyn Connection>) {
        for listener in self.listeners.read().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.closed(connection))).is_err() {
                log::warn!(
                    "connection listener panicked in closed({})",
                    connection.protocol()
                );
            }
        }
    }
}

/// The provided statistics listener: lock-free counters only.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    opened: AtomicU64,
    closed: AtomicU64,
    current: AtomicI64,
    peak: AtomicI64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn total_closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

impl ConnectionListener for ConnectionStats {
    fn opened(&self, _connection: &Arc<dyn Connection>) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    fn closed(&self, _connection: &Arc<dyn Connection>) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_sub(1, Ordering::Relaxed);
    }
}
