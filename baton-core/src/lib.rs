//! Core domain models and orchestration components for baton
//!
//! This crate contains the fundamental domain models and the four
//! orchestration components used to coordinate a pool of autonomous
//! coding agents: the message router, the agent lifecycle manager,
//! the task queue with capability-based assignment, and the workspace
//! isolation manager.

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod orchestration;
pub mod snapshot;
pub mod task;

pub use error::{Error, Result};
