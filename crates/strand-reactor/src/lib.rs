//! # strand-reactor — the readiness-driven I/O reactor
//!
//! A fixed pool of managed selectors multiplexes thousands of channels
//! without per-channel threads. Each selector owns one `mio::Poll`, a
//! lock-free action queue and a deadline heap, and runs a cooperative
//! loop on its own thread: drain actions, poll, dispatch readiness,
//! expire deadlines.
//!
//! Layering, bottom up:
//!
//! - [`channel`] — the transport capability trait and listener setup;
//! - [`endpoint`] — non-blocking read/write with single-shot callback
//!   interest, the write flusher and idle timeouts;
//! - [`connection`] — the protocol-facing hooks bound to an endpoint,
//!   swappable at runtime via [`endpoint::Endpoint::upgrade`];
//! - [`selector`] / [`manager`] — the loops and the round-robin router
//!   with endpoint/connection factory inversion;
//! - [`stream`] — pull/push content streams layered over endpoints.
//!
//! The reactor is cooperative: long computation on a selector thread
//! stalls every channel assigned to it. Hand long work to the
//! [`executor`], or set `dispatch_io` to move all fill/write dispatch
//! off the selector threads.

pub mod channel;
pub mod config;
pub mod connection;
mod deadline;
pub mod endpoint;
pub mod executor;
pub mod listener;
pub mod manager;
pub mod selector;
pub mod stream;

pub use channel::{listen, Channel};
pub use config::ReactorConfig;
pub use connection::{arm_fill_interest, Connection, Counters, Fillable};
pub use endpoint::{Endpoint, Fill, SocketEndpoint};
pub use executor::{Executor, FixedExecutor, InlineExecutor};
pub use listener::{ConnectionListener, ConnectionStats, Listeners};
pub use manager::{
    no_context, ConnectionFactory, Context, EndpointFactory, SelectorManager,
    SocketEndpointFactory,
};
pub use selector::{ManagedSelector, SelectorHandle};
pub use stream::{EndpointSink, StreamConnection};
