//! The managed selector: one readiness loop owning a set of channels.
//!
//! Each selector runs on its own named OS thread and loops: drain the
//! action queue, compute the poll timeout from the earliest deadline,
//! block in `mio::Poll::poll`, dispatch ready tokens, expire deadlines.
//! Cross-thread work reaches the loop exclusively through the lock-free
//! action queue plus a waker; everything the loop owns (the poll, the
//! token slab, the deadline heap) is single-threaded.
//!
//! Dispatch policy: ready endpoints get `on-readable` then `on-writable`
//! inline on the selector thread by default; with `dispatch_io` the
//! whole dispatch is handed to the executor, trading a context switch
//! per I/O event for a stall-free loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use strand_core::{Callback, StrandError};

use crate::channel::Channel;
use crate::deadline::DeadlineQueue;
use crate::endpoint::Endpoint;
use crate::executor::{Executor, Task};
use crate::listener::Listeners;
use crate::manager::{ConnectionFactory, Context, EndpointFactory};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Work marshaled onto a selector thread.
pub(crate) enum Action {
    /// Register a prepared channel and build its endpoint + connection.
    Adopt {
        channel: Box<dyn Channel>,
        context: Context,
    },
    /// Register a connecting channel; finish on connect readiness.
    Connect {
        channel: Box<dyn Channel>,
        context: Context,
        connected: Callback,
    },
    /// Drop a closed endpoint's registry slot.
    Remove(Token),
    /// (Re)schedule a deadline for a registered token.
    Deadline { token: Token, at: Instant },
    /// Arbitrary work on the selector thread.
    Task(Task),
}

/// Environment a selector needs to build endpoints and connections;
/// assembled by the selector manager.
pub(crate) struct SelectorEnv {
    pub endpoint_factory: Arc<dyn EndpointFactory>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub listeners: Arc<Listeners>,
    pub executor: Arc<dyn Executor>,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub dispatch_io: bool,
}

pub(crate) struct SelectorShared {
    id: usize,
    queue: SegQueue<Action>,
    waker: Waker,
    stopped: AtomicBool,
}

/// Cheap cloneable reference to one selector's submission side. Held by
/// endpoints and the manager; opaque to embedders.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<SelectorShared>,
}

impl SelectorHandle {
    pub(crate) fn submit(&self, action: Action) {
        self.shared.queue.push(action);
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            log::warn!("selector {} wake failed: {}", self.shared.id, e);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

/// Handle to one running selector loop.
pub struct ManagedSelector {
    shared: Arc<SelectorShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ManagedSelector {
    /// Create the selector and start its loop thread.
    pub(crate) fn spawn(id: usize, env: Arc<SelectorEnv>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(SelectorShared {
            id,
            queue: SegQueue::new(),
            waker,
            stopped: AtomicBool::new(false),
        });

        let mut select_loop = SelectorLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            shared: shared.clone(),
            env,
            registered: Slab::new(),
            deadlines: DeadlineQueue::new(),
        };

        let thread = thread::Builder::new()
            .name(format!("strand-selector-{}", id))
            .spawn(move || select_loop.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SelectorHandle {
        SelectorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Ask the loop to stop; `join` to wait for it.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            log::warn!("selector {} stop wake failed: {}", self.shared.id, e);
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ManagedSelector {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

enum Registered {
    Connecting {
        channel: Option<Box<dyn Channel>>,
        context: Context,
        connected: Option<Callback>,
        deadline: Instant,
    },
    Established(Arc<dyn Endpoint>),
}

struct SelectorLoop {
    poll: Poll,
    events: Events,
    /// Batch buffer reused across loop iterations.
    ready: Vec<(Token, bool, bool)>,
    shared: Arc<SelectorShared>,
    env: Arc<SelectorEnv>,
    registered: Slab<Registered>,
    deadlines: DeadlineQueue,
}

impl SelectorLoop {
    fn run(&mut self) {
        log::debug!("selector {} started", self.shared.id);
        loop {
            self.drain_actions();
            if self.shared.stopped.load(Ordering::Acquire) {
                break;
            }

            let timeout = self
                .deadlines
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("selector {} poll failed: {}", self.shared.id, e);
                    break;
                }
            }

            let mut batch = std::mem::take(&mut self.ready);
            batch.clear();
            batch.extend(self.events.iter().map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                )
            }));
            for &(token, readable, writable) in &batch {
                if token == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(token, readable, writable);
            }
            self.ready = batch;

            self.expire(Instant::now());
        }
        self.shutdown();
        log::debug!("selector {} stopped", self.shared.id);
    }

    fn drain_actions(&mut self) {
        while let Some(action) = self.shared.queue.pop() {
            match action {
                Action::Adopt { channel, context } => self.adopt(channel, &context),
                Action::Connect {
                    channel,
                    context,
                    connected,
                } => self.start_connect(channel, context, connected),
                Action::Remove(token) => {
                    if self.registered.contains(token.0) {
                        self.registered.remove(token.0);
                    }
                }
                Action::Deadline { token, at } => self.deadlines.push(at, token),
                Action::Task(task) => task(),
            }
        }
    }

    /// Register a ready-to-use channel and bring up its endpoint.
    fn adopt(&mut self, mut channel: Box<dyn Channel>, context: &Context) {
        let entry = self.registered.vacant_entry();
        let token = Token(entry.key());

        if let Err(e) = channel.register(
            self.poll.registry(),
            token,
            Interest::READABLE.add(Interest::WRITABLE),
        ) {
            log::warn!("selector {} register failed: {}", self.shared.id, e);
            return;
        }

        let endpoint = self.env.endpoint_factory.new_endpoint(
            channel,
            token,
            SelectorHandle {
                shared: self.shared.clone(),
            },
            self.env.listeners.clone(),
            self.env.idle_timeout,
        );
        entry.insert(Registered::Established(endpoint.clone()));

        if let Some(timeout) = endpoint.idle_timeout() {
            self.deadlines.push(Instant::now() + timeout, token);
        }

        let connection = self.env.connection_factory.new_connection(&endpoint, context);
        endpoint.bind(connection);
        log::trace!("selector {} adopted {:?}", self.shared.id, token);
    }

    fn start_connect(
        &mut self,
        mut channel: Box<dyn Channel>,
        context: Context,
        connected: Callback,
    ) {
        let entry = self.registered.vacant_entry();
        let token = Token(entry.key());

        if let Err(e) = channel.register(self.poll.registry(), token, Interest::WRITABLE) {
            connected.failed(e.into());
            return;
        }

        let deadline = Instant::now() + self.env.connect_timeout;
        entry.insert(Registered::Connecting {
            channel: Some(channel),
            context,
            connected: Some(connected),
            deadline,
        });
        self.deadlines.push(deadline, token);
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        enum Target {
            Gone, // closed before this event drained
            Endpoint(Arc<dyn Endpoint>),
            Connecting,
        }

        let target = match self.registered.get(token.0) {
            None => Target::Gone,
            Some(Registered::Established(endpoint)) => Target::Endpoint(endpoint.clone()),
            Some(Registered::Connecting { .. }) => Target::Connecting,
        };

        match target {
            Target::Gone => {}
            Target::Connecting => self.finish_connect(token),
            Target::Endpoint(endpoint) => {
                if self.env.dispatch_io {
                    self.env
                        .executor
                        .execute(Box::new(move || endpoint.on_selected(readable, writable)));
                } else {
                    endpoint.on_selected(readable, writable);
                }
            }
        }
    }

    /// Connect readiness: resolve the pending connect one way or the
    /// other, or keep waiting on a spurious wakeup.
    fn finish_connect(&mut self, token: Token) {
        enum Outcome {
            Ready(Box<dyn Channel>, Context, Callback),
            Failed(Callback, StrandError),
            Pending,
        }

        let outcome = match self.registered.get_mut(token.0) {
            Some(Registered::Connecting {
                channel,
                context,
                connected,
                ..
            }) => {
                let ch = channel.as_mut().expect("connecting entry has channel");
                match ch.take_error() {
                    Ok(Some(e)) => {
                        Outcome::Failed(connected.take().expect("unresolved"), e.into())
                    }
                    Err(e) => Outcome::Failed(connected.take().expect("unresolved"), e.into()),
                    Ok(None) => match ch.peer_addr() {
                        Ok(_) => Outcome::Ready(
                            channel.take().expect("connecting entry has channel"),
                            context.clone(),
                            connected.take().expect("unresolved"),
                        ),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => Outcome::Pending,
                        Err(e) => {
                            Outcome::Failed(connected.take().expect("unresolved"), e.into())
                        }
                    },
                }
            }
            _ => return,
        };

        match outcome {
            Outcome::Pending => {}
            Outcome::Failed(connected, cause) => {
                log::debug!("selector {} connect failed: {}", self.shared.id, cause);
                self.registered.remove(token.0);
                connected.failed(cause);
            }
            Outcome::Ready(mut channel, context, connected) => {
                if let Err(e) = channel.reregister(
                    self.poll.registry(),
                    token,
                    Interest::READABLE.add(Interest::WRITABLE),
                ) {
                    self.registered.remove(token.0);
                    connected.failed(e.into());
                    return;
                }

                let endpoint = self.env.endpoint_factory.new_endpoint(
                    channel,
                    token,
                    SelectorHandle {
                        shared: self.shared.clone(),
                    },
                    self.env.listeners.clone(),
                    self.env.idle_timeout,
                );
                self.registered[token.0] = Registered::Established(endpoint.clone());

                if let Some(timeout) = endpoint.idle_timeout() {
                    self.deadlines.push(Instant::now() + timeout, token);
                }

                let connection = self
                    .env
                    .connection_factory
                    .new_connection(&endpoint, &context);
                endpoint.bind(connection);
                connected.succeeded();
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        for token in self.deadlines.pop_due(now) {
            enum Due {
                Endpoint(Arc<dyn Endpoint>),
                ConnectExpired(Callback),
                ConnectWaiting(Instant),
                Gone,
            }

            let due = match self.registered.get_mut(token.0) {
                None => Due::Gone,
                Some(Registered::Established(endpoint)) => Due::Endpoint(endpoint.clone()),
                Some(Registered::Connecting {
                    connected, deadline, ..
                }) => {
                    if now >= *deadline {
                        Due::ConnectExpired(connected.take().expect("unresolved"))
                    } else {
                        Due::ConnectWaiting(*deadline)
                    }
                }
            };

            match due {
                Due::Gone => {}
                Due::ConnectWaiting(at) => self.deadlines.push(at, token),
                Due::ConnectExpired(connected) => {
                    log::debug!("selector {} connect timed out", self.shared.id);
                    self.registered.remove(token.0);
                    connected.failed(StrandError::Timeout);
                }
                Due::Endpoint(endpoint) => {
                    if let Some(next) = endpoint.on_deadline(now) {
                        self.deadlines.push(next, token);
                    }
                }
            }
        }
    }

    /// Stop: close every registered channel, fail pending continuations,
    /// drain the action queue.
    fn shutdown(&mut self) {
        let entries: Vec<Registered> = self.registered.drain().collect();
        for entry in entries {
            match entry {
                Registered::Established(endpoint) => endpoint.close(),
                Registered::Connecting { connected, .. } => {
                    if let Some(connected) = connected {
                        connected.failed(StrandError::Closed);
                    }
                }
            }
        }

        while let Some(action) = self.shared.queue.pop() {
            match action {
                Action::Adopt { .. } => {} // channel drops closed
                Action::Connect { connected, .. } => connected.failed(StrandError::Closed),
                Action::Task(_) => log::debug!(
                    "selector {} dropped queued task at shutdown",
                    self.shared.id
                ),
                Action::Remove(_) | Action::Deadline { .. } => {}
            }
        }
    }
}
