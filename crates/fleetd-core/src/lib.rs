//! Orchestration core: admission, dispatch, event fan-out, background work,
//! and liveness detection for coding-agent runs.
//!
//! This crate has no opinion on transport (gRPC/HTTP/CLI) or persistence
//! beyond the [`fleetd_db`] Store it is built on -- those live in
//! `fleetd-cli`. Every component here is constructed with its dependencies
//! passed in explicitly (pool, gateway, clock, config) rather than reaching
//! for globals, so the CLI crate wires the graph once at startup.

pub mod background;
pub mod clock;
pub mod config;
pub mod deadrun;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pool;
pub mod scheduler;
pub mod state;
