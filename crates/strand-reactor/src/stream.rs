//! Content streams over endpoints.
//!
//! [`StreamConnection`] is a connection that exposes itself as a
//! [`Source`]: fill events produce pooled chunks, demand re-arms fill
//! interest, EOF terminates the source and a transient fill failure
//! (idle timeout) surfaces as a transient failure chunk for the reader
//! to ignore or act on. Backpressure is structural: no fill interest
//! is armed while a chunk sits unread and nobody demands.
//!
//! [`EndpointSink`] is the write half: a [`Sink`] whose single
//! outstanding write flows through [`Endpoint::write`]; the `last`
//! write shuts down output after it completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use strand_core::{Callback, Chunk, ChunkPool, ChunkQueue, Sink, Source, StrandError};

use crate::connection::{arm_fill_interest, Connection, Counters, Fillable};
use crate::endpoint::{Endpoint, Fill};

const FILL_SIZE: usize = 8 * 1024;

pub struct StreamConnection {
    weak: Weak<StreamConnection>,
    endpoint: Arc<dyn Endpoint>,
    pool: ChunkPool,
    queue: ChunkQueue,
    filling: AtomicBool,
    counters: Counters,
}

impl StreamConnection {
    pub fn new(endpoint: Arc<dyn Endpoint>, pool: ChunkPool) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            endpoint,
            pool,
            queue: ChunkQueue::new(),
            filling: AtomicBool::new(false),
            counters: Counters::new(),
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn arm(&self) {
        if !self.filling.swap(true, Ordering::AcqRel) {
            if let Some(me) = self.weak.upgrade() {
                arm_fill_interest(self.endpoint.as_ref(), &me);
            }
        }
    }
}

impl Connection for StreamConnection {
    fn protocol(&self) -> &'static str {
        "stream"
    }

    fn on_open(&self) {
        self.arm();
    }

    fn on_close(&self, cause: Option<&StrandError>) {
        match cause {
            None => self.queue.close(),
            Some(cause) => self.queue.fail(cause.clone()),
        }
    }
}

impl Fillable for StreamConnection {
    fn on_fillable(&self) {
        self.filling.store(false, Ordering::Release);
        loop {
            let mut lease = self.pool.acquire(FILL_SIZE);
            match self.endpoint.fill(&mut lease) {
                Ok(Fill::Data(n)) => {
                    self.counters.record_in(n);
                    let _ = self.queue.offer(lease.freeze(false));
                    // Offering consumed any waiting demand; only keep
                    // pulling from the socket while someone still wants
                    // the next chunk.
                    if !self.queue.demand_pending() {
                        return;
                    }
                }
                Ok(Fill::Empty) => {
                    drop(lease);
                    self.arm();
                    return;
                }
                Ok(Fill::Eof) => {
                    drop(lease);
                    self.queue.close();
                    return;
                }
                Err(cause) => {
                    drop(lease);
                    self.queue.fail(cause.clone());
                    self.endpoint.close_with(Some(cause));
                    return;
                }
            }
        }
    }

    fn on_fill_failed(&self, cause: StrandError) {
        self.filling.store(false, Ordering::Release);
        if cause.is_transient() {
            // Surface the timeout; the reader decides whether to keep
            // going, and its next demand re-arms us.
            let _ = self.queue.offer(Chunk::failure(cause, false));
        } else {
            self.queue.fail(cause.clone());
            self.endpoint.close_with(Some(cause));
        }
    }
}

impl Source for StreamConnection {
    fn read(&self) -> Option<Chunk> {
        self.queue.read()
    }

    fn demand(&self, callback: Callback) {
        self.queue.demand(callback);
        if !self.queue.is_terminated() && self.queue.buffered() == 0 {
            self.arm();
        }
    }

    fn fail(&self, cause: StrandError) {
        self.queue.fail(cause);
    }
}

pub struct EndpointSink {
    endpoint: Arc<dyn Endpoint>,
    finished: AtomicBool,
}

impl EndpointSink {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            finished: AtomicBool::new(false),
        })
    }
}

impl Sink for EndpointSink {
    fn write(&self, last: bool, data: Bytes, callback: Callback) {
        if self.finished.load(Ordering::Acquire) {
            callback.failed(StrandError::Closed);
            return;
        }
        if last {
            self.finished.store(true, Ordering::Release);
            let endpoint = self.endpoint.clone();
            let wrapped = Callback::new(move |result| {
                if result.is_ok() {
                    endpoint.shutdown_output();
                }
                callback.complete(result);
            });
            self.endpoint.write(wrapped, vec![data]);
        } else {
            self.endpoint.write(callback, vec![data]);
        }
    }
}
