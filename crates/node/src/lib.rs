//! `crdata-node` library crate.
//!
//! The processing node polls a crdata server for queued jobs, runs each
//! job's script through an interpreter, stores results and logs, and reports
//! the outcome. The binary entrypoint lives in `main.rs`; the modules are
//! public for integration testing.

pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod node;
pub mod poll;
pub mod store;
