//! The CAPTURE core (spec.md §1-§9): a single-threaded event loop that
//! multiplexes heterogeneous packet sources, merges them into a single
//! time-ordered batch stream, dispatches each batch through per-module
//! filters and capture callbacks, sheds load under pressure, and serves
//! zero or more out-of-process capture clients over a shared-memory ring.
//!
//! Everything outside that core — SUPERVISOR, EXPORT/STORAGE, QUERY, and
//! concrete sniffer drivers — is an external collaborator; this crate
//! only specifies its contract with them (spec.md §1).

pub mod arena;
pub mod cabuf;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod filter;
pub mod ipc;
pub mod loadshed;
pub mod merge;
pub mod module;
pub mod packet;
pub mod ppbuf;
pub mod sniffer;
pub mod stats;
pub mod timestamp;

pub use crate::error::{CaptureError, Result};
pub use crate::event_loop::CaptureCore;
