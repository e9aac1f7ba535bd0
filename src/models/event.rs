//! Lifecycle notifications returned by the provider and requirer state machines
//!
//! Each re-evaluation returns its notifications in emission order; the host
//! dispatches them to its own handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::certificate::ProviderCertificate;
use super::relation::RelationId;

/// Why a certificate stopped being usable
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationReason {
    Expired,
    Revoked,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "expired"),
            InvalidationReason::Revoked => write!(f, "revoked"),
        }
    }
}

/// Notifications raised on the provider side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// A requirer published a CSR with no certificate listed for it
    CertificateCreationRequest {
        certificate_signing_request: String,
        relation_id: RelationId,
        is_ca: bool,
    },
    /// A listed certificate answers a CSR nobody requests any more
    CertificateRevocationRequest {
        certificate: String,
        certificate_signing_request: String,
        ca: String,
        chain: Vec<String>,
    },
}

impl ProviderEvent {
    pub(crate) fn revocation_request(cert: &ProviderCertificate) -> Self {
        ProviderEvent::CertificateRevocationRequest {
            certificate: cert.certificate.clone(),
            certificate_signing_request: cert.csr.clone(),
            ca: cert.ca.clone(),
            chain: cert.chain.clone(),
        }
    }

    /// CSR the notification is about
    pub fn certificate_signing_request(&self) -> &str {
        match self {
            ProviderEvent::CertificateCreationRequest {
                certificate_signing_request,
                ..
            }
            | ProviderEvent::CertificateRevocationRequest {
                certificate_signing_request,
                ..
            } => certificate_signing_request,
        }
    }
}

/// Notifications raised on the requirer side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RequirerEvent {
    /// The provider issued a certificate for one of our CSRs
    CertificateAvailable {
        certificate: String,
        certificate_signing_request: String,
        ca: String,
        chain: Vec<String>,
    },
    /// A certificate is inside the notification window
    CertificateExpiring {
        certificate: String,
        expiry: DateTime<Utc>,
    },
    /// A certificate expired or was revoked by the provider
    CertificateInvalidated {
        reason: InvalidationReason,
        certificate: String,
        certificate_signing_request: String,
        ca: String,
        chain: Vec<String>,
    },
    /// The relation is gone, along with every certificate it carried
    AllCertificatesInvalidated,
}

impl RequirerEvent {
    pub(crate) fn available(cert: &ProviderCertificate) -> Self {
        RequirerEvent::CertificateAvailable {
            certificate: cert.certificate.clone(),
            certificate_signing_request: cert.csr.clone(),
            ca: cert.ca.clone(),
            chain: cert.chain.clone(),
        }
    }

    pub(crate) fn invalidated(reason: InvalidationReason, cert: &ProviderCertificate) -> Self {
        RequirerEvent::CertificateInvalidated {
            reason,
            certificate: cert.certificate.clone(),
            certificate_signing_request: cert.csr.clone(),
            ca: cert.ca.clone(),
            chain: cert.chain.clone(),
        }
    }
}
