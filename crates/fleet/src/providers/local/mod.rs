//! In-process simulated backend.
//!
//! Keeps instances in memory, optionally mirrored to an inventory YAML
//! file so that separate CLI invocations see the same fleet. Addresses
//! follow a fixed pattern per launch index:
//!
//! - `host-N.testing.invalid` (public host name)
//! - `host-N.internal.invalid` (cloud-local host name)
//! - `8.0.0.N` (public IPv4)
//! - `127.0.0.N` (cloud-local IPv4)
//!
//! Faults can be injected per operation to exercise retry, timeout and
//! credential handling.

mod client;
mod models;

pub use client::LocalBackend;
pub use models::*;
