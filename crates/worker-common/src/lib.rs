//! Shared domain types for the turbobackend job orchestration worker.
//!
//! Kept as its own workspace member so that adapter crates or future
//! sibling binaries (e.g. an operational CLI for queue inspection) can
//! depend on the data model without pulling in the worker's
//! `tokio`-heavy adapter implementations.

pub mod domain;
pub mod ids;
