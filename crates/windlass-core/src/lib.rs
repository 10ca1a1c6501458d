//! Durable workflow execution: entity session, command pipeline,
//! execution-tree interpreter, and cluster-safe job execution.
//!
//! This crate defines the storage "port" ([`storage::StorageBackend`]) that
//! the infrastructure layer implements. It depends only on `windlass-types`
//! -- never on `windlass-infra` or any database crate.

pub mod command;
pub mod commands;
pub mod engine;
pub mod error;
pub mod expression;
pub mod graph;
pub mod interpreter;
pub mod job;
pub mod session;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;
