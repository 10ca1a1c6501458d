//! Observability for the windlass engine.

pub mod tracing_setup;
