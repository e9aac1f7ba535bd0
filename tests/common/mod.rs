//! Common test utilities and helpers
//!
//! This module provides shared test infrastructure including:
//! - A test certificate authority and CSR helpers
//! - A provider/requirer deployment over one in-memory relation store

pub mod fixtures;

pub use fixtures::*;
