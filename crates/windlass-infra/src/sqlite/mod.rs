//! SQLite storage backend with split read/write pools.

pub mod pool;
pub mod store;
