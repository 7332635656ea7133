//! taskpilot: batch automation core.
//!
//! Coordinates a pool of quota-limited identities, a bounded pool of
//! expensive execution sessions, a serialized confirmation-code poller and
//! a durable task queue, so many long-running workflows can run against a
//! rate-limited external target with bounded concurrency and isolated
//! per-task failure.

pub mod api;
pub mod collaborator;
pub mod config;
pub mod confirm;
pub mod error;
pub mod identity;
pub mod runner;
pub mod session;
pub mod store;
pub mod tasks;
pub mod util;
