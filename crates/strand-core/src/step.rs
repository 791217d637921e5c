//! The iterating step driver.
//!
//! Callback-chained loops ("write, and when the write completes, write
//! again") blow the stack when completions are synchronous: each
//! completion would re-enter the step recursively. `StepDriver` breaks
//! the recursion by turning it into iteration: a synchronous completion
//! is *recorded* while the step is still running, and the outer loop
//! re-invokes the step instead of the completion re-entering it.
//!
//! States: `Idle`, `Processing`, `Pending`, `Called`, `Succeeded`,
//! `Failed`, `Closed`.
//!
//! - `iterate()` on an idle driver runs the processing loop on the
//!   calling thread. On a driver that is mid-step it records `Called`
//!   so the wakeup is not lost.
//! - `process` returns [`Step::Scheduled`] after starting an async
//!   operation with the driver registered as its callback, [`Step::Idle`]
//!   to pause until the next `iterate()`, or [`Step::Done`] to finish.
//! - A synchronous `succeeded()` (invoked before `process` returns)
//!   moves `Processing → Called`; the loop then re-runs `process`.
//!   An asynchronous one moves `Pending → Processing` and re-enters the
//!   loop from the completing thread.
//! - An `Err` from `process`, or `failed(cause)`, terminates the loop
//!   through `on_failure`.
//!
//! This is the only mechanism the core offers for "loop while
//! non-blocking progress is possible"; echo pumps, copy pumps and write
//! pipelines are all built on it.

use std::sync::{Arc, Mutex};

use crate::callback::Callback;
use crate::error::{Result, StrandError};

/// Outcome of one `process` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// An async operation was started and the driver registered as its
    /// callback; the loop resumes on completion.
    Scheduled,
    /// Nothing to do right now; the loop resumes on the next `iterate()`.
    Idle,
    /// The loop is complete.
    Done,
}

/// The user-supplied step of a driver.
pub trait Process: Send + 'static {
    /// Perform one bounded unit of work. The driver handle is passed in
    /// so the step can mint callbacks for the operations it schedules.
    fn process(&mut self, driver: &StepDriver) -> Result<Step>;

    /// Terminal hook after [`Step::Done`].
    fn on_success(&mut self) {}

    /// Terminal hook after a failure or close.
    fn on_failure(&mut self, _cause: &StrandError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Processing,
    Pending,
    Called,
    Succeeded,
    Failed,
    Closed,
}

struct Cell {
    state: State,
    /// Failure cause recorded while a step was running; consumed by the
    /// processing loop.
    fail: Option<StrandError>,
    /// A close arrived while a step was running.
    close_on_exit: bool,
}

struct Shared {
    cell: Mutex<Cell>,
    // The step is never invoked concurrently; this lock also serializes
    // the terminal hooks against the step itself.
    process: Mutex<Box<dyn Process>>,
}

/// Cheap cloneable handle; all clones drive the same loop.
#[derive(Clone)]
pub struct StepDriver {
    shared: Arc<Shared>,
}

impl StepDriver {
    pub fn new(process: impl Process) -> Self {
        Self {
            shared: Arc::new(Shared {
                cell: Mutex::new(Cell {
                    state: State::Idle,
                    fail: None,
                    close_on_exit: false,
                }),
                process: Mutex::new(Box::new(process)),
            }),
        }
    }

    /// Start or resume the loop. Safe to call from any thread, any
    /// state; a call landing mid-step records a pending wakeup.
    pub fn iterate(&self) {
        {
            let mut cell = self.shared.cell.lock().unwrap();
            match cell.state {
                State::Idle => cell.state = State::Processing,
                State::Processing => {
                    cell.state = State::Called;
                    return;
                }
                _ => return,
            }
        }
        self.processing();
    }

    /// Async-operation success. `Pending` resumes the loop on this
    /// thread; `Processing` records the completion for the outer loop.
    pub fn succeeded(&self) {
        {
            let mut cell = self.shared.cell.lock().unwrap();
            match cell.state {
                State::Processing => {
                    cell.state = State::Called;
                    return;
                }
                State::Pending => cell.state = State::Processing,
                _ => return,
            }
        }
        self.processing();
    }

    /// Async-operation failure; ends the loop through `on_failure`.
    pub fn failed(&self, cause: StrandError) {
        {
            let mut cell = self.shared.cell.lock().unwrap();
            match cell.state {
                // A step is on the stack somewhere; let its loop observe
                // the failure after the step returns.
                State::Processing | State::Called => {
                    cell.state = State::Failed;
                    cell.fail = Some(cause);
                    return;
                }
                State::Pending | State::Idle => {
                    cell.state = State::Failed;
                }
                _ => return,
            }
        }
        self.finish_failure(cause, false);
    }

    /// Terminal close. A pending loop is failed with `Closed`; an idle
    /// or finished driver just stops accepting iterations.
    pub fn close(&self) {
        let run_failure = {
            let mut cell = self.shared.cell.lock().unwrap();
            match cell.state {
                State::Idle | State::Succeeded | State::Failed => {
                    cell.state = State::Closed;
                    false
                }
                State::Pending => {
                    cell.state = State::Closed;
                    true
                }
                State::Processing | State::Called => {
                    cell.close_on_exit = true;
                    return;
                }
                State::Closed => return,
            }
        };
        if run_failure {
            let mut process = self.shared.process.lock().unwrap();
            process.on_failure(&StrandError::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cell.lock().unwrap().state == State::Closed
    }

    /// A callback completing an operation scheduled by `process`.
    pub fn callback(&self) -> Callback {
        let driver = self.clone();
        Callback::new(move |result| match result {
            Ok(()) => driver.succeeded(),
            Err(cause) => driver.failed(cause),
        })
    }

    /// A callback that resumes an idle loop, for wakeups that are not
    /// operation completions (e.g. `Source::demand`).
    pub fn iterate_callback(&self) -> Callback {
        let driver = self.clone();
        Callback::new(move |result| match result {
            Ok(()) => driver.iterate(),
            Err(cause) => driver.failed(cause),
        })
    }

    /// The processing loop. Invariants: the state is `Processing` on
    /// entry; the cell lock is never held across a `process` call, so a
    /// synchronous completion can record itself.
    fn processing(&self) {
        loop {
            let step = {
                let mut process = self.shared.process.lock().unwrap();
                process.process(self)
            };

            let mut cell = self.shared.cell.lock().unwrap();

            // A failure or close recorded while the step ran wins over
            // whatever the step returned.
            if cell.state == State::Failed {
                let cause = cell.fail.take().unwrap_or(StrandError::Closed);
                let close = cell.close_on_exit;
                drop(cell);
                self.finish_failure(cause, close);
                return;
            }

            match step {
                Err(cause) => {
                    cell.state = State::Failed;
                    let close = cell.close_on_exit;
                    drop(cell);
                    self.finish_failure(cause, close);
                    return;
                }
                Ok(Step::Done) => {
                    cell.state = State::Succeeded;
                    let close = cell.close_on_exit;
                    drop(cell);
                    let mut process = self.shared.process.lock().unwrap();
                    process.on_success();
                    drop(process);
                    if close {
                        self.close();
                    }
                    return;
                }
                Ok(Step::Idle) => match cell.state {
                    State::Called => cell.state = State::Processing,
                    State::Processing => {
                        if cell.close_on_exit {
                            cell.state = State::Closed;
                            drop(cell);
                            let mut process = self.shared.process.lock().unwrap();
                            process.on_failure(&StrandError::Closed);
                            return;
                        }
                        cell.state = State::Idle;
                        return;
                    }
                    state => unreachable!("step driver idle from {:?}", state),
                },
                Ok(Step::Scheduled) => match cell.state {
                    // The operation completed synchronously; loop.
                    State::Called => cell.state = State::Processing,
                    State::Processing => {
                        cell.state = State::Pending;
                        return;
                    }
                    state => unreachable!("step driver scheduled from {:?}", state),
                },
            }
        }
    }

    fn finish_failure(&self, cause: StrandError, close_after: bool) {
        {
            let mut process = self.shared.process.lock().unwrap();
            process.on_failure(&cause);
        }
        if close_after {
            self.close();
        }
    }
}

impl std::fmt::Debug for StepDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.shared.cell.lock().unwrap();
        f.debug_struct("StepDriver")
            .field("state", &cell.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting {
        remaining: usize,
        depth: Arc<AtomicUsize>,
        max_depth: Arc<AtomicUsize>,
        done: Arc<AtomicBool>,
    }

    impl Process for Counting {
        fn process(&mut self, driver: &StepDriver) -> Result<Step> {
            let d = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_depth.fetch_max(d, Ordering::SeqCst);

            let step = if self.remaining == 0 {
                Ok(Step::Done)
            } else {
                self.remaining -= 1;
                // Schedule an operation that completes synchronously,
                // before this step returns.
                driver.callback().succeeded();
                Ok(Step::Scheduled)
            };

            self.depth.fetch_sub(1, Ordering::SeqCst);
            step
        }

        fn on_success(&mut self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_synchronous_completion_is_iterative() {
        let depth = Arc::new(AtomicUsize::new(0));
        let max_depth = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let driver = StepDriver::new(Counting {
            remaining: 10_000,
            depth: depth.clone(),
            max_depth: max_depth.clone(),
            done: done.clone(),
        });
        driver.iterate();

        assert!(done.load(Ordering::SeqCst));
        // Stack depth bounded by a constant, not the iteration count.
        assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    }

    struct Pausing {
        steps: usize,
        done: Arc<AtomicBool>,
    }

    impl Process for Pausing {
        fn process(&mut self, _driver: &StepDriver) -> Result<Step> {
            if self.steps == 0 {
                return Ok(Step::Done);
            }
            self.steps -= 1;
            Ok(Step::Idle)
        }

        fn on_success(&mut self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_idle_resumes_on_iterate() {
        let done = Arc::new(AtomicBool::new(false));
        let driver = StepDriver::new(Pausing {
            steps: 3,
            done: done.clone(),
        });

        driver.iterate();
        assert!(!done.load(Ordering::SeqCst));
        driver.iterate();
        driver.iterate();
        assert!(!done.load(Ordering::SeqCst));
        driver.iterate();
        assert!(done.load(Ordering::SeqCst));
    }

    struct Async {
        started: bool,
        cb_slot: Arc<Mutex<Option<Callback>>>,
        done: Arc<AtomicBool>,
    }

    impl Process for Async {
        fn process(&mut self, driver: &StepDriver) -> Result<Step> {
            if self.started {
                return Ok(Step::Done);
            }
            self.started = true;
            *self.cb_slot.lock().unwrap() = Some(driver.callback());
            Ok(Step::Scheduled)
        }

        fn on_success(&mut self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_asynchronous_completion_resumes() {
        let slot = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        let driver = StepDriver::new(Async {
            started: false,
            cb_slot: slot.clone(),
            done: done.clone(),
        });

        driver.iterate();
        assert!(!done.load(Ordering::SeqCst));

        let cb = slot.lock().unwrap().take().unwrap();
        let handle = std::thread::spawn(move || cb.succeeded());
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    struct Failing {
        failure: Arc<Mutex<Option<StrandError>>>,
    }

    impl Process for Failing {
        fn process(&mut self, _driver: &StepDriver) -> Result<Step> {
            Err(StrandError::Protocol("bad frame"))
        }

        fn on_failure(&mut self, cause: &StrandError) {
            *self.failure.lock().unwrap() = Some(cause.clone());
        }
    }

    #[test]
    fn test_step_error_becomes_failure() {
        let failure = Arc::new(Mutex::new(None));
        let driver = StepDriver::new(Failing {
            failure: failure.clone(),
        });
        driver.iterate();
        assert_eq!(
            failure.lock().unwrap().clone(),
            Some(StrandError::Protocol("bad frame"))
        );
        // Terminal: further iterations are no-ops.
        driver.iterate();
    }

    struct Park {
        cb_slot: Arc<Mutex<Option<Callback>>>,
        failure: Arc<Mutex<Option<StrandError>>>,
    }

    impl Process for Park {
        fn process(&mut self, driver: &StepDriver) -> Result<Step> {
            *self.cb_slot.lock().unwrap() = Some(driver.callback());
            Ok(Step::Scheduled)
        }

        fn on_failure(&mut self, cause: &StrandError) {
            *self.failure.lock().unwrap() = Some(cause.clone());
        }
    }

    #[test]
    fn test_close_fails_pending_loop() {
        let slot = Arc::new(Mutex::new(None));
        let failure = Arc::new(Mutex::new(None));
        let driver = StepDriver::new(Park {
            cb_slot: slot.clone(),
            failure: failure.clone(),
        });

        driver.iterate();
        driver.close();
        assert!(driver.is_closed());
        assert_eq!(failure.lock().unwrap().clone(), Some(StrandError::Closed));

        // The orphaned operation callback is now inert.
        slot.lock().unwrap().take().unwrap().succeeded();
        assert!(driver.is_closed());
    }
}
