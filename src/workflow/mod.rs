//! Workflow unit plumbing
//!
//! This module provides:
//! - deterministic workflow id derivation per unit kind
//! - duplicate-submission suppression (id collision is a no-op)
//! - the retry policy applied to activities

mod dispatch;
mod id;
mod retry;

pub use dispatch::*;
pub use id::*;
pub use retry::*;
