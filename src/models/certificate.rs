//! Certificate and CSR documents exchanged over the tls-certificates relation

use serde::{Deserialize, Serialize};

use super::relation::RelationId;

/// Top-level key of the requirer unit databag
pub const REQUIRER_CSRS_KEY: &str = "certificate_signing_requests";

/// Top-level key of the provider application databag
pub const PROVIDER_CERTIFICATES_KEY: &str = "certificates";

/// A certificate signing request published by a requirer unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequirerCsr {
    /// PEM-encoded PKCS#10 request, trimmed
    #[serde(rename = "certificate_signing_request")]
    pub csr: String,
    /// Whether a CA certificate is requested
    #[serde(rename = "ca", default)]
    pub is_ca: bool,
}

impl RequirerCsr {
    pub fn new(csr: impl Into<String>, is_ca: bool) -> Self {
        Self {
            csr: csr.into(),
            is_ca,
        }
    }
}

/// Requirer unit databag document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirerState {
    #[serde(default)]
    pub certificate_signing_requests: Vec<RequirerCsr>,
}

/// A certificate issued by the provider for one CSR
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCertificate {
    /// The CSR this certificate answers
    #[serde(rename = "certificate_signing_request")]
    pub csr: String,
    /// PEM-encoded leaf certificate
    pub certificate: String,
    /// PEM-encoded issuing CA certificate
    pub ca: String,
    /// Certificate chain, in the order the provider gave it
    #[serde(default)]
    pub chain: Vec<String>,
    /// Set once the provider revoked the certificate in place
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revoked: bool,
}

impl ProviderCertificate {
    pub fn new(
        csr: impl Into<String>,
        certificate: impl Into<String>,
        ca: impl Into<String>,
        chain: Vec<String>,
    ) -> Self {
        Self {
            csr: csr.into(),
            certificate: certificate.into(),
            ca: ca.into(),
            chain,
            revoked: false,
        }
    }

    /// Same csr, certificate, ca and chain, ignoring the revocation flag
    pub fn same_issue(&self, other: &ProviderCertificate) -> bool {
        self.csr == other.csr
            && self.certificate == other.certificate
            && self.ca == other.ca
            && self.chain == other.chain
    }
}

/// Provider application databag document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderState {
    #[serde(default)]
    pub certificates: Vec<ProviderCertificate>,
}

/// Issued certificate pair reported by `get_issued_certificates`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedCertificateSummary {
    pub csr: String,
    pub certificate: String,
}

/// CSRs published by one requirer unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitCsrMapping {
    pub relation_id: RelationId,
    pub application_name: String,
    pub unit_name: String,
    pub unit_csrs: Vec<RequirerCsr>,
}
