//! Domain logic for the crdata processing node.
//!
//! Everything here is free of network access: job payload parsing, job
//! status, and the interpreter subprocess runner. The HTTP side lives in
//! `crdata-client`, the polling loop in `crdata-node`.

pub mod error;
pub mod hashing;
pub mod job;
pub mod scripting;
pub mod types;
