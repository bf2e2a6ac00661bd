//! Database layer: connection pooling, migrations, and typed queries for
//! the orchestration core's durable state.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
