//! Storage backends for the windlass engine.
//!
//! Implements the `StorageBackend` port defined in `windlass-core`: a SQLite
//! backend with split read/write pools for durable deployments, and an
//! in-memory backend for tests and ephemeral embedding.

pub mod memory;
pub mod sqlite;
