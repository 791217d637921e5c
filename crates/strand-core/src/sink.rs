//! Push-based chunk sinks and the source→sink copy pump.
//!
//! A [`Sink`] accepts one write at a time; completion fires exactly once
//! when the write has been fully consumed. `last = true` marks the
//! terminal write; anything after it fails with `Closed`.
//!
//! [`copy`] pumps a source into a sink through the step driver, which is
//! what keeps a fast producer with synchronous write completions from
//! recursing: each completed write iterates instead of re-entering.

use std::sync::Arc;

use bytes::Bytes;

use crate::callback::Callback;
use crate::error::{Result, StrandError};
use crate::source::Source;
use crate::step::{Process, Step, StepDriver};

pub trait Sink: Send + Sync {
    /// Enqueue one write. At most one may be outstanding; `last` marks
    /// the terminal write.
    fn write(&self, last: bool, data: Bytes, callback: Callback);
}

/// Pump `source` into `sink` until the last chunk is written, then
/// complete `done`. Demand is issued exactly when `read` returns `None`;
/// empty non-last chunks are released and skipped; any failure chunk
/// (transient included) fails the pump with its cause.
pub fn copy(source: Arc<dyn Source>, sink: Arc<dyn Sink>, done: Callback) {
    let driver = StepDriver::new(CopyPump {
        source,
        sink,
        done: Some(done),
        sent_last: false,
    });
    driver.iterate();
}

struct CopyPump {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    done: Option<Callback>,
    sent_last: bool,
}

impl Process for CopyPump {
    fn process(&mut self, driver: &StepDriver) -> Result<Step> {
        if self.sent_last {
            return Ok(Step::Done);
        }
        loop {
            let chunk = match self.source.read() {
                None => {
                    self.source.demand(driver.iterate_callback());
                    return Ok(Step::Idle);
                }
                Some(chunk) => chunk,
            };

            if let Some(cause) = chunk.failure_cause() {
                let cause = cause.clone();
                chunk.release();
                return Err(cause);
            }
            if chunk.is_empty() && !chunk.is_last() {
                chunk.release();
                continue;
            }

            let last = chunk.is_last();
            let data = chunk.to_bytes();
            chunk.release();
            self.sent_last = last;
            self.sink.write(last, data, driver.callback());
            return Ok(Step::Scheduled);
        }
    }

    fn on_success(&mut self) {
        if let Some(done) = self.done.take() {
            done.succeeded();
        }
    }

    fn on_failure(&mut self, cause: &StrandError) {
        if let Some(done) = self.done.take() {
            done.failed(cause.clone());
        }
    }
}

/// Blocking adaptors: callback completion converted into a thread park.
/// The explicit trade-off is one blocked OS thread per operation; the
/// non-blocking model stays primary.
pub mod blocking {
    use bytes::Bytes;

    use crate::callback::Latch;
    use crate::chunk::Chunk;
    use crate::error::Result;
    use crate::sink::Sink;
    use crate::source::Source;

    /// Write and park until the sink completes it.
    pub fn write(sink: &dyn Sink, last: bool, data: Bytes) -> Result<()> {
        let latch = Latch::new();
        sink.write(last, data, latch.callback());
        latch.wait(None)
    }

    /// Read the next chunk, parking on demand as needed. The returned
    /// chunk may itself be a failure chunk; errors from the demand path
    /// surface as `Err`.
    pub fn read(source: &dyn Source) -> Result<Chunk> {
        loop {
            if let Some(chunk) = source.read() {
                return Ok(chunk);
            }
            let latch = Latch::new();
            source.demand(latch.callback());
            latch.wait(None)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::source::ChunkQueue;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records writes and completes them synchronously.
    struct RecordingSink {
        writes: Mutex<Vec<(usize, bool)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    impl Sink for RecordingSink {
        fn write(&self, last: bool, data: Bytes, callback: Callback) {
            self.writes.lock().unwrap().push((data.len(), last));
            callback.succeeded();
        }
    }

    fn data(n: usize) -> Chunk {
        Chunk::of(Bytes::from(vec![b'x'; n]), false)
    }

    #[test]
    fn test_copy_skips_empty_and_propagates_last() {
        let source = Arc::new(ChunkQueue::new());
        let sink = RecordingSink::new();
        let ok = Arc::new(AtomicBool::new(false));

        // Sizes [10, 0, 20, last-0]: the empty non-last chunk is
        // skipped, the terminal empty chunk becomes the last write.
        source.offer(data(10)).unwrap();
        source.offer(data(0)).unwrap();
        source.offer(data(20)).unwrap();
        source.close();

        let done = {
            let ok = ok.clone();
            Callback::new(move |r| {
                assert!(r.is_ok());
                ok.store(true, Ordering::SeqCst);
            })
        };
        copy(source, sink.clone(), done);

        assert!(ok.load(Ordering::SeqCst));
        assert_eq!(
            *sink.writes.lock().unwrap(),
            vec![(10, false), (20, false), (0, true)]
        );
    }

    #[test]
    fn test_copy_demands_exactly_on_empty_read() {
        let source = Arc::new(ChunkQueue::new());
        let sink = RecordingSink::new();
        let ok = Arc::new(AtomicBool::new(false));

        let done = {
            let ok = ok.clone();
            Callback::new(move |r| {
                assert!(r.is_ok());
                ok.store(true, Ordering::SeqCst);
            })
        };
        copy(source.clone(), sink.clone(), done);

        // The pump is parked on demand.
        assert!(source.demand_pending());
        assert!(sink.writes.lock().unwrap().is_empty());

        source.offer(data(5)).unwrap();
        assert_eq!(*sink.writes.lock().unwrap(), vec![(5, false)]);
        assert!(source.demand_pending(), "pump re-demands after draining");

        source.offer(Chunk::of(Bytes::from_static(b"end"), true)).unwrap();
        assert!(ok.load(Ordering::SeqCst));
        assert_eq!(
            *sink.writes.lock().unwrap(),
            vec![(5, false), (3, true)]
        );
    }

    #[test]
    fn test_copy_fails_on_failure_chunk() {
        let source = Arc::new(ChunkQueue::new());
        let sink = RecordingSink::new();
        let seen = Arc::new(Mutex::new(None));

        source.offer(data(4)).unwrap();
        source.offer(Chunk::failure(StrandError::Timeout, false)).unwrap();

        let done = {
            let seen = seen.clone();
            Callback::new(move |r| {
                *seen.lock().unwrap() = Some(r);
            })
        };
        copy(source, sink.clone(), done);

        assert_eq!(*seen.lock().unwrap(), Some(Err(StrandError::Timeout)));
        assert_eq!(*sink.writes.lock().unwrap(), vec![(4, false)]);
    }

    /// Sink completing synchronously: the pump must not recurse.
    struct DepthSink {
        depth: Arc<AtomicUsize>,
        max_depth: Arc<AtomicUsize>,
    }

    impl Sink for DepthSink {
        fn write(&self, _last: bool, _data: Bytes, callback: Callback) {
            let d = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_depth.fetch_max(d, Ordering::SeqCst);
            callback.succeeded();
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_copy_depth_bounded_under_synchronous_completion() {
        let source = Arc::new(ChunkQueue::new());
        for _ in 0..1_000 {
            source.offer(data(1)).unwrap();
        }
        source.close();

        let max_depth = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(DepthSink {
            depth: Arc::new(AtomicUsize::new(0)),
            max_depth: max_depth.clone(),
        });
        copy(source, sink, Callback::noop());
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_write() {
        let sink = RecordingSink::new();
        blocking::write(sink.as_ref(), true, Bytes::from_static(b"bye")).unwrap();
        assert_eq!(*sink.writes.lock().unwrap(), vec![(3, true)]);
    }

    #[test]
    fn test_blocking_read() {
        let source = Arc::new(ChunkQueue::new());
        let producer = source.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            producer.offer(data(7)).unwrap();
            producer.close();
        });

        let chunk = blocking::read(source.as_ref()).unwrap();
        assert_eq!(chunk.len(), 7);
        chunk.release();
        assert!(blocking::read(source.as_ref()).unwrap().is_eof());
        handle.join().unwrap();
    }
}
