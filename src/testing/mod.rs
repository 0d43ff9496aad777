//! Testing utilities and mock implementations
//!
//! Test doubles for exercising the broker link and workers without a running
//! broker.

pub mod mocks;

pub use mocks::*;
