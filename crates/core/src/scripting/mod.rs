//! Script execution through an external interpreter.
//!
//! [`executor`] defines the [`ScriptExecutor`](executor::ScriptExecutor)
//! trait and its input/output types, [`interpreter`] the executor that hands
//! a source file to an interpreter binary (`Rscript` by default), and
//! [`subprocess`] the shared spawn/capture/timeout logic.

pub mod executor;
pub mod interpreter;
pub mod subprocess;
