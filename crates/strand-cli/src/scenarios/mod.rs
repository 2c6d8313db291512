//! Workloads run by the `strand` binary
//!
//! Each scenario drives a runtime to completion, checks its own result,
//! and returns a one-line summary.

pub mod fan_in;
pub mod philosophers;
pub mod ping_pong;
pub mod pipeline;
