//! wsrelay - WebSocket echo relay with heartbeat-driven liveness
//!
//! Every accepted connection runs two independent loops: one reads
//! payloads from the peer, the other writes them back and probes the peer
//! with periodic pings. A peer that stops acknowledging probes is
//! disconnected once its read deadline expires.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod network;
pub mod relay;

pub use error::{RelayError, Result};
