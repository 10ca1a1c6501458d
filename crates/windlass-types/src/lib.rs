//! Shared domain types for the windlass workflow engine.
//!
//! This crate holds the persisted entity model (executions, jobs, variables),
//! the immutable process graph consumed by the interpreter, storage value
//! types (selectors, write operations), engine configuration, and shared
//! error enums. It depends on nothing but serde/uuid/chrono -- never on the
//! engine or any storage crate.

pub mod config;
pub mod entity;
pub mod error;
pub mod process;
