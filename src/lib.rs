//! Calltrace - in-process usage tracing with call-path reconstruction
//!
//! This library runs inside a monitored process and turns low-level
//! execution callbacks (emitted by already-instrumented code) into
//! aggregated usage records and vulnerability-relevant call paths, shipped
//! in batches to a remote store via a backend collaborator.
//!
//! The code-rewriting step producing the callbacks, the REST backend, and
//! configuration loading live outside this crate.

pub mod archive;
pub mod backend;
pub mod collector;
pub mod config;
pub mod construct;
pub mod dwarf;
pub mod gate;
pub mod loader;
pub mod reconstruct;
pub mod stack;
pub mod stats;
pub mod upload;
pub mod usage;

pub use backend::{AppContext, Backend, ExecutionContext};
pub use collector::{CallbackKind, TraceCoordinator, TraceOptions};
pub use construct::{ConstructId, ConstructKind, Lang};
pub use stack::RawFrame;
