//! Execgate - An HTTP gateway that dispatches fixed routes to external executables
//!
//! This library provides a small dispatch gateway that:
//! - Maps a fixed set of (method, path) routes to configured executables
//! - Spawns the matching executable directly, never through a shell
//! - Optionally forwards the request headers as a single encoded argument
//! - Enforces a wall-clock timeout and bounded output capture per invocation
//! - Bounds the number of concurrently running subprocesses
//! - Relays subprocess stdout back as the HTTP response body

pub mod config;
pub mod executor;
pub mod gateway;
pub mod metadata;
pub mod response;
pub mod routes;
