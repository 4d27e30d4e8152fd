//! Test support utilities shared across the workspace
//!
//! Enabled for this crate's own tests and, for downstream crates, through the
//! `test-utils` feature.

pub mod mocks;
