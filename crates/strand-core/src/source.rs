//! Pull-based chunk sources.
//!
//! A [`Source`] is a lazy, finite, non-restartable producer of chunks.
//! `read` never blocks: it returns a chunk when one is available, `None`
//! when the caller should register demand, and, once terminal, the same
//! terminal chunk on every subsequent call. At most one demand may be
//! outstanding.
//!
//! [`ChunkQueue`] is the concrete producer-side implementation: a
//! bounded-by-convention queue with `offer`/`close`/`fail` on the
//! producer side and the `Source` contract on the consumer side.
//! Offering content fires a registered demand on the producer's thread;
//! demand registered while content is already available fires on the
//! caller's thread before `demand` returns.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::callback::Callback;
use crate::chunk::Chunk;
use crate::error::StrandError;

pub trait Source: Send + Sync {
    /// Non-blocking read. `None` means "nothing right now; demand".
    fn read(&self) -> Option<Chunk>;

    /// One-shot notification that content may be available. A second
    /// demand while one is outstanding is a usage error: the offending
    /// callback is failed immediately and the registered one stays.
    fn demand(&self, callback: Callback);

    /// Terminal failure: every future read returns a fatal failure
    /// chunk with this cause; an outstanding demand is fired.
    fn fail(&self, cause: StrandError);
}

struct QueueState {
    chunks: VecDeque<Chunk>,
    demand: Option<Callback>,
    eos: bool,
    failed: Option<StrandError>,
}

/// Producer-fed [`Source`].
pub struct ChunkQueue {
    state: Mutex<QueueState>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                demand: None,
                eos: false,
                failed: None,
            }),
        }
    }

    /// Queue a chunk for the consumer. A `last` chunk (or a fatal
    /// failure chunk) also terminates the queue. Fails with `Closed`
    /// once the queue is terminal; the rejected chunk is released.
    pub fn offer(&self, chunk: Chunk) -> Result<(), StrandError> {
        let demand = {
            let mut state = self.state.lock().unwrap();
            if state.eos || state.failed.is_some() {
                drop(state);
                chunk.release();
                return Err(StrandError::Closed);
            }
            if chunk.is_failure() && chunk.is_last() {
                state.failed = chunk.failure_cause().cloned();
                state.chunks.clear();
            } else {
                if chunk.is_last() {
                    state.eos = true;
                }
                if chunk.has_data() || chunk.is_failure() {
                    state.chunks.push_back(chunk);
                }
            }
            state.demand.take()
        };
        if let Some(cb) = demand {
            cb.succeeded();
        }
        Ok(())
    }

    /// Terminate normally: after queued chunks drain, reads return EOF.
    pub fn close(&self) {
        let demand = {
            let mut state = self.state.lock().unwrap();
            state.eos = true;
            state.demand.take()
        };
        if let Some(cb) = demand {
            cb.succeeded();
        }
    }

    /// Chunks queued and not yet read.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    /// Whether a consumer demand is waiting.
    pub fn demand_pending(&self) -> bool {
        self.state.lock().unwrap().demand.is_some()
    }

    /// Whether the queue reached EOF or failed.
    pub fn is_terminated(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.eos || state.failed.is_some()
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for ChunkQueue {
    fn read(&self) -> Option<Chunk> {
        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.chunks.pop_front() {
            return Some(chunk);
        }
        if let Some(cause) = &state.failed {
            return Some(Chunk::failure(cause.clone(), true));
        }
        if state.eos {
            return Some(Chunk::eof());
        }
        None
    }

    fn demand(&self, callback: Callback) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            if state.demand.is_some() {
                drop(state);
                log::warn!("demand while demand pending");
                callback.failed(StrandError::Usage("demand pending"));
                return;
            }
            let ready =
                !state.chunks.is_empty() || state.eos || state.failed.is_some();
            if !ready {
                state.demand = Some(callback);
                return;
            }
            ready
        };
        debug_assert!(ready);
        callback.succeeded();
    }

    fn fail(&self, cause: StrandError) {
        let demand = {
            let mut state = self.state.lock().unwrap();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(cause);
            state.chunks.clear();
            state.demand.take()
        };
        if let Some(cb) = demand {
            cb.succeeded();
        }
    }
}
