//! Cucumber features for the certificates relation

pub mod step_definitions;
pub mod support;

pub use support::TestWorld;
