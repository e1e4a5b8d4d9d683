//! iopub - forward stdout/stderr text over a message bus without blocking
//! the threads that produce it.
//!
//! Module layout:
//! - wake / queue: wake-up channel and task queue of the worker loop
//! - worker: the single thread that owns the bus socket
//! - fork: master/descendant detection for fork-safe sends
//! - stream: `OutStream`, the buffered text stream, and descriptor watching
//! - bus / wire / envelope: transport, framing and message seams
//! - config / logging / diag: ambient plumbing

pub mod bus;
pub mod config;
pub mod diag;
pub mod envelope;
pub mod fork;
pub mod logging;
pub mod queue;
pub mod stream;
pub mod wake;
pub mod wire;
pub mod worker;

pub use bus::{BusSocket, PipeOut, TcpBus};
pub use config::{load_config, ConfigError, IoPubConfig};
pub use envelope::{Envelope, JsonEnvelope, StreamContent};
pub use fork::{ForkGuard, PipeTarget, ProcessMode};
pub use stream::{without_flush_wait, OutStream, StreamError};
pub use wire::Frame;
pub use worker::Worker;
