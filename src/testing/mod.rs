//! Testing utilities
//!
//! A scriptable broker for exercising failure paths without a real queue manager.

pub mod mocks;

pub use mocks::*;
