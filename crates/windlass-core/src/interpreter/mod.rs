//! Execution-tree interpreter.
//!
//! Executions advance through the process graph by draining an explicit FIFO
//! queue of atomic operations on the command context; there is no recursion,
//! so arbitrarily deep fork fan-outs and scope nestings run in constant
//! stack. A wait state is simply an execution left active at an activity
//! with nothing queued -- the unit of work ends, and resumption is a fresh
//! command (signal, job firing, API call).

pub mod behavior;
pub mod ops;
pub mod variables;

pub use ops::{AtomicOperation, run_operations};
