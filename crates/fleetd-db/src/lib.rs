//! Postgres-backed storage for runs, tasks, task runtimes, run events,
//! background work, and repositories.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
