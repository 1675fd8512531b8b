//! Logging setup for the dockhand binaries.
//!
//! All crates log through `tracing`; this crate only owns installing the
//! global subscriber, either human-readable or JSON.

pub mod logging;
