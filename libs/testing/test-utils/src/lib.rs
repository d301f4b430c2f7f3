//! Test infrastructure helpers
//!
//! Container-backed backing services for integration tests.

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;
