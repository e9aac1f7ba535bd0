//! Integration tests for the certificates relation
//!
//! These tests drive a provider and requirer units against one in-memory
//! relation store with real keys, CSRs and certificates.

mod provider_tests;
mod requirer_tests;
