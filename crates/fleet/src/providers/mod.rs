//! Compute backend implementations.

pub mod local;
