//! # strand-core — primitives of the strand I/O core
//!
//! This crate holds everything below the reactor that does not touch an
//! OS selector: one-shot completion [`Callback`]s, the [`StepDriver`]
//! that turns recursive async completion into bounded iteration,
//! reference-counted [`Chunk`]s with their [`ChunkPool`], and the
//! pull/push content layer ([`Source`], [`Sink`], [`copy`]).
//!
//! ## Design principle
//!
//! Ownership of bytes moves along the read chain (endpoint, connection,
//! application) as chunk hand-offs, never as copies. A retain is taken
//! only when a reference must outlive the current scope; release is the
//! explicit spelling of drop. Every loop built on completions goes
//! through the step driver so synchronous completion cannot grow the
//! stack.

pub mod callback;
pub mod chunk;
pub mod error;
pub mod pool;
pub mod sink;
pub mod source;
pub mod step;

pub use callback::{Callback, Latch};
pub use chunk::Chunk;
pub use error::{Result, StrandError};
pub use pool::{ChunkPool, Lease, PoolStats};
pub use sink::{blocking, copy, Sink};
pub use source::{ChunkQueue, Source};
pub use step::{Process, Step, StepDriver};
