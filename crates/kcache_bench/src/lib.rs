//! Shared fixtures for the kcache benchmarks.

pub mod utils;
