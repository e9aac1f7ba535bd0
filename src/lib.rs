//! TLS certificates relation interface
//!
//! Certificate lifecycle between a provider application that signs
//! certificates and requirer applications that request them, exchanged over a
//! shared relation store. Includes the X.509 helpers both sides use to create
//! keys, CSRs, CAs and certificates.

pub mod config;
pub mod models;
pub mod services;
pub mod utils;

pub use config::AppConfig;
pub use models::{InvalidationReason, ProviderEvent, RequirerEvent};
pub use services::{TlsCertificatesProvider, TlsCertificatesRequirer};
pub use utils::{TlsError, TlsResult};

/// Identifier of this relation library; default prefix for secret labels
pub const LIBRARY_ID: &str = "afd8c2bccf834997afce12c2706d2ede";
