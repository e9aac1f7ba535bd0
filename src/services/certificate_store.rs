//! Certificate store adapter over relation databags
//!
//! Databag values are JSON-encoded where possible. A value that does not
//! decode is kept as a plain string, so older peers writing raw strings do
//! not break the reader. A document that fails validation reads as empty,
//! but a databag the store cannot read is an error for every caller.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    DatabagOwner, ProviderCertificate, ProviderState, RelationId, RequirerCsr, RequirerState,
    PROVIDER_CERTIFICATES_KEY, REQUIRER_CSRS_KEY,
};
use crate::services::relation_store::RelationStore;
use crate::utils::error::TlsResult;
use crate::utils::validation::{validate_provider_payload, validate_requirer_payload};

/// Read and update the CSR and certificate documents of a relation
pub struct CertificateStore<'a, S: RelationStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RelationStore + ?Sized> CertificateStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Decode every key of a databag
    pub fn load_relation_data(
        &self,
        relation_id: RelationId,
        owner: &DatabagOwner,
    ) -> TlsResult<BTreeMap<String, Value>> {
        let raw = self.store.read(relation_id, owner).map_err(|e| {
            warn!(relation_id, owner = %owner, error = %e, "Databag not readable");
            e
        })?;

        Ok(raw
            .into_iter()
            .map(|(key, value)| {
                let decoded = serde_json::from_str(&value).unwrap_or(Value::String(value));
                (key, decoded)
            })
            .collect())
    }

    /// A databag as a JSON object, for schema validation
    pub fn load_document(&self, relation_id: RelationId, owner: &DatabagOwner) -> TlsResult<Value> {
        let data = self.load_relation_data(relation_id, owner)?;
        Ok(Value::Object(data.into_iter().collect()))
    }

    /// CSRs published by a requirer unit, empty when the document is invalid
    pub fn load_requirer_csrs(
        &self,
        relation_id: RelationId,
        unit: &str,
    ) -> TlsResult<Vec<RequirerCsr>> {
        let document = self.load_document(relation_id, &DatabagOwner::Unit(unit.to_string()))?;
        if !validate_requirer_payload(&document) {
            debug!(relation_id, unit, "Requirer relation data did not pass validation");
            return Ok(Vec::new());
        }
        Ok(parse_requirer_state(document).certificate_signing_requests)
    }

    /// Certificates listed by a provider application
    ///
    /// When `app` is our own application only the leader reads it; other units
    /// get an empty list.
    pub fn load_provider_certificates(
        &self,
        relation_id: RelationId,
        app: &str,
    ) -> TlsResult<Vec<ProviderCertificate>> {
        if app == self.store.local_app() && !self.store.is_leader() {
            return Ok(Vec::new());
        }
        let document = self.load_document(relation_id, &DatabagOwner::App(app.to_string()))?;
        if document.get(PROVIDER_CERTIFICATES_KEY).is_none() {
            return Ok(Vec::new());
        }
        if !validate_provider_payload(&document) {
            warn!(relation_id, app, "Provider relation data did not pass validation");
            return Ok(Vec::new());
        }
        Ok(parse_provider_state(document).certificates)
    }

    /// Append a certificate to our provider document unless already listed
    pub fn add_certificate(
        &self,
        relation_id: RelationId,
        certificate: ProviderCertificate,
    ) -> TlsResult<()> {
        if !self.store.is_leader() {
            debug!(relation_id, "Not leader, skipping certificate add");
            return Ok(());
        }
        let mut certificates = self.own_certificates(relation_id)?;
        if certificates.iter().any(|c| c.same_issue(&certificate)) {
            debug!(relation_id, "Certificate already listed");
            return Ok(());
        }
        certificates.push(certificate);
        self.write_certificates(relation_id, &certificates)
    }

    /// Remove every entry matching the certificate text or the CSR text
    pub fn remove_certificate(
        &self,
        relation_id: RelationId,
        certificate: Option<&str>,
        csr: Option<&str>,
    ) -> TlsResult<()> {
        if !self.store.is_leader() {
            debug!(relation_id, "Not leader, skipping certificate removal");
            return Ok(());
        }
        let certificates = self.own_certificates(relation_id)?;
        let before = certificates.len();
        let kept: Vec<ProviderCertificate> = certificates
            .into_iter()
            .filter(|entry| {
                let by_certificate = certificate.is_some_and(|c| entry.certificate == c);
                let by_csr = csr.is_some_and(|c| entry.csr == c);
                !(by_certificate || by_csr)
            })
            .collect();
        if kept.len() == before {
            return Ok(());
        }
        self.write_certificates(relation_id, &kept)
    }

    /// Replace whatever is listed for the certificate's CSR
    pub fn set_certificate(
        &self,
        relation_id: RelationId,
        certificate: ProviderCertificate,
    ) -> TlsResult<()> {
        let certificate = ProviderCertificate {
            csr: certificate.csr.trim().to_string(),
            certificate: certificate.certificate.trim().to_string(),
            ca: certificate.ca.trim().to_string(),
            chain: certificate
                .chain
                .iter()
                .map(|pem| pem.trim().to_string())
                .collect(),
            revoked: certificate.revoked,
        };
        self.remove_certificate(relation_id, None, Some(&certificate.csr))?;
        self.add_certificate(relation_id, certificate)
    }

    /// Mark every certificate of our provider document revoked
    pub fn revoke_all(&self, relation_id: RelationId) -> TlsResult<()> {
        if !self.store.is_leader() {
            debug!(relation_id, "Not leader, skipping revocation");
            return Ok(());
        }
        let mut certificates = self.own_certificates(relation_id)?;
        for certificate in &mut certificates {
            certificate.revoked = true;
        }
        self.write_certificates(relation_id, &certificates)
    }

    /// CSRs in our own unit databag
    pub fn own_requirer_csrs(&self, relation_id: RelationId) -> TlsResult<Vec<RequirerCsr>> {
        let document = self.load_document(
            relation_id,
            &DatabagOwner::Unit(self.store.local_unit().to_string()),
        )?;
        if document.get(REQUIRER_CSRS_KEY).is_none() {
            return Ok(Vec::new());
        }
        Ok(parse_requirer_state(document).certificate_signing_requests)
    }

    /// Publish a CSR from our unit; a no-op if the same entry exists
    pub fn add_requirer_csr(&self, relation_id: RelationId, csr: &str, is_ca: bool) -> TlsResult<()> {
        let entry = RequirerCsr::new(csr.trim(), is_ca);
        let mut csrs = self.own_requirer_csrs(relation_id)?;
        if csrs.contains(&entry) {
            debug!(relation_id, "CSR already registered");
            return Ok(());
        }
        csrs.push(entry);
        self.write_requirer_csrs(relation_id, &csrs)
    }

    /// Withdraw a CSR from our unit, whatever its CA flag
    pub fn remove_requirer_csr(&self, relation_id: RelationId, csr: &str) -> TlsResult<()> {
        let csr = csr.trim();
        let csrs = self.own_requirer_csrs(relation_id)?;
        let before = csrs.len();
        let kept: Vec<RequirerCsr> = csrs.into_iter().filter(|entry| entry.csr != csr).collect();
        if kept.len() == before {
            debug!(relation_id, "CSR not registered, nothing to remove");
            return Ok(());
        }
        self.write_requirer_csrs(relation_id, &kept)
    }

    fn own_certificates(&self, relation_id: RelationId) -> TlsResult<Vec<ProviderCertificate>> {
        let document = self.load_document(
            relation_id,
            &DatabagOwner::App(self.store.local_app().to_string()),
        )?;
        if document.get(PROVIDER_CERTIFICATES_KEY).is_none() {
            return Ok(Vec::new());
        }
        Ok(parse_provider_state(document).certificates)
    }

    fn write_certificates(
        &self,
        relation_id: RelationId,
        certificates: &[ProviderCertificate],
    ) -> TlsResult<()> {
        let encoded = serde_json::to_string(certificates)?;
        self.store.write(
            relation_id,
            &DatabagOwner::App(self.store.local_app().to_string()),
            PROVIDER_CERTIFICATES_KEY,
            encoded,
        )
    }

    fn write_requirer_csrs(&self, relation_id: RelationId, csrs: &[RequirerCsr]) -> TlsResult<()> {
        let encoded = serde_json::to_string(csrs)?;
        self.store.write(
            relation_id,
            &DatabagOwner::Unit(self.store.local_unit().to_string()),
            REQUIRER_CSRS_KEY,
            encoded,
        )
    }
}

fn parse_requirer_state(document: Value) -> RequirerState {
    serde_json::from_value(document).unwrap_or_else(|e| {
        warn!(error = %e, "Could not decode requirer CSR list");
        RequirerState::default()
    })
}

fn parse_provider_state(document: Value) -> ProviderState {
    serde_json::from_value(document).unwrap_or_else(|e| {
        warn!(error = %e, "Could not decode provider certificate list");
        ProviderState::default()
    })
}
