//! Provider side of the certificate lifecycle
//!
//! The provider answers CSRs published by requirer units. Every re-evaluation
//! diffs the requirers' CSR lists against our certificate list and returns the
//! notifications the host should act on.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use crate::models::{
    DatabagOwner, IssuedCertificateSummary, ProviderCertificate, ProviderEvent, Relation,
    RelationId, UnitCsrMapping,
};
use crate::services::certificate_store::CertificateStore;
use crate::services::relation_store::RelationStore;
use crate::services::x509::csr_matches_certificate;
use crate::utils::error::{TlsError, TlsResult};
use crate::utils::validation::validate_requirer_payload;

/// Certificate provider bound to one relation endpoint
pub struct TlsCertificatesProvider<S: RelationStore> {
    store: S,
    relation_name: String,
}

impl<S: RelationStore> TlsCertificatesProvider<S> {
    pub fn new(store: S, relation_name: impl Into<String>) -> Self {
        Self {
            store,
            relation_name: relation_name.into(),
        }
    }

    pub fn relation_name(&self) -> &str {
        &self.relation_name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn certificates(&self) -> CertificateStore<'_, S> {
        CertificateStore::new(&self.store)
    }

    fn relation(&self, relation_id: RelationId) -> TlsResult<Relation> {
        self.store
            .get_relation(&self.relation_name, Some(relation_id))
            .ok_or_else(|| {
                TlsError::RelationNotFound(format!("{} (id {})", self.relation_name, relation_id))
            })
    }

    fn relations_for(&self, relation_id: Option<RelationId>) -> Vec<Relation> {
        self.store
            .relations(&self.relation_name)
            .into_iter()
            .filter(|relation| relation_id.map_or(true, |id| relation.id == id))
            .collect()
    }

    /// Re-evaluate a relation after a requirer unit changed its databag
    ///
    /// Emits a creation request for each of the unit's CSRs that has no
    /// certificate listed, then a revocation request for each listed
    /// certificate no unit of the relation asks for any more. Stale
    /// certificates are removed before returning.
    pub fn on_relation_changed(
        &self,
        relation_id: RelationId,
        unit: Option<&str>,
    ) -> TlsResult<Vec<ProviderEvent>> {
        let Some(unit) = unit else {
            error!(relation_id, "Relation changed without a remote unit");
            return Ok(Vec::new());
        };
        if !self.store.is_leader() {
            return Ok(Vec::new());
        }
        let relation = self.relation(relation_id)?;

        let document = self
            .certificates()
            .load_document(relation_id, &DatabagOwner::Unit(unit.to_string()))?;
        if !validate_requirer_payload(&document) {
            debug!(relation_id, unit, "Relation data did not pass validation");
            return Ok(Vec::new());
        }

        let requested = self.certificates().load_requirer_csrs(relation_id, unit)?;
        let provided = self
            .certificates()
            .load_provider_certificates(relation_id, self.store.local_app())?;
        let provided_csrs: BTreeSet<&str> = provided.iter().map(|c| c.csr.as_str()).collect();

        let mut events = Vec::new();
        for request in requested {
            if !provided_csrs.contains(request.csr.as_str()) {
                info!(relation_id, unit, is_ca = request.is_ca, "Certificate creation requested");
                events.push(ProviderEvent::CertificateCreationRequest {
                    certificate_signing_request: request.csr,
                    relation_id,
                    is_ca: request.is_ca,
                });
            }
        }

        events.extend(self.revoke_certificates_for_which_no_csr_exists(&relation)?);
        Ok(events)
    }

    /// Revoke certificates whose CSR no unit of the relation publishes
    ///
    /// Every unit's databag must be readable; otherwise nothing is revoked
    /// and the read error is returned.
    fn revoke_certificates_for_which_no_csr_exists(
        &self,
        relation: &Relation,
    ) -> TlsResult<Vec<ProviderEvent>> {
        let mut requested = BTreeSet::new();
        for unit in &relation.units {
            for request in self.certificates().load_requirer_csrs(relation.id, unit)? {
                requested.insert(request.csr);
            }
        }

        let provided = self
            .certificates()
            .load_provider_certificates(relation.id, self.store.local_app())?;

        let mut events = Vec::new();
        for certificate in provided {
            if requested.contains(&certificate.csr) {
                continue;
            }
            info!(relation_id = relation.id, "Revoking certificate with no matching CSR");
            events.push(ProviderEvent::revocation_request(&certificate));
            self.remove_certificate(&certificate.certificate)?;
        }
        Ok(events)
    }

    /// Publish a certificate for a CSR, replacing any earlier one
    ///
    /// Only the leader writes; other units return without doing anything.
    pub fn set_relation_certificate(
        &self,
        certificate: &str,
        certificate_signing_request: &str,
        ca: &str,
        chain: &[String],
        relation_id: RelationId,
    ) -> TlsResult<()> {
        if !self.store.is_leader() {
            return Ok(());
        }
        self.relation(relation_id)?;
        self.certificates().set_certificate(
            relation_id,
            ProviderCertificate::new(certificate_signing_request, certificate, ca, chain.to_vec()),
        )?;
        info!(relation_id, "Certificate set in relation data");
        Ok(())
    }

    /// Remove a certificate from every relation on the endpoint
    pub fn remove_certificate(&self, certificate: &str) -> TlsResult<()> {
        let relations = self.store.relations(&self.relation_name);
        if relations.is_empty() {
            return Err(TlsError::RelationNotFound(self.relation_name.clone()));
        }
        for relation in relations {
            self.certificates()
                .remove_certificate(relation.id, Some(certificate), None)?;
        }
        Ok(())
    }

    /// Mark every issued certificate revoked, e.g. after replacing the CA
    pub fn revoke_all_certificates(&self) -> TlsResult<()> {
        if !self.store.is_leader() {
            debug!("Not leader, not revoking certificates");
            return Ok(());
        }
        for relation in self.store.relations(&self.relation_name) {
            self.certificates().revoke_all(relation.id)?;
        }
        info!(relation = %self.relation_name, "All certificates revoked");
        Ok(())
    }

    /// Non-revoked certificates per requirer application
    ///
    /// A relation whose certificate list cannot be read is logged and shows
    /// no certificates.
    pub fn get_issued_certificates(
        &self,
        relation_id: Option<RelationId>,
    ) -> BTreeMap<String, Vec<IssuedCertificateSummary>> {
        let mut issued: BTreeMap<String, Vec<IssuedCertificateSummary>> = BTreeMap::new();
        for relation in self.relations_for(relation_id) {
            let Some(app) = relation.app.clone() else {
                continue;
            };
            let summaries = issued.entry(app).or_default();
            let provided = self
                .certificates()
                .load_provider_certificates(relation.id, self.store.local_app())
                .unwrap_or_else(|e| {
                    warn!(relation_id = relation.id, error = %e, "Skipping unreadable certificate list");
                    Vec::new()
                });
            for certificate in provided {
                if certificate.revoked {
                    continue;
                }
                summaries.push(IssuedCertificateSummary {
                    csr: certificate.csr,
                    certificate: certificate.certificate,
                });
            }
        }
        issued
    }

    /// CSRs published by every requirer unit; unreadable units are skipped
    pub fn get_requirer_csrs(&self, relation_id: Option<RelationId>) -> Vec<UnitCsrMapping> {
        let mut mappings = Vec::new();
        for relation in self.relations_for(relation_id) {
            let application_name = relation.app.clone().unwrap_or_default();
            for unit in &relation.units {
                let unit_csrs = match self.certificates().load_requirer_csrs(relation.id, unit) {
                    Ok(csrs) => csrs,
                    Err(e) => {
                        warn!(relation_id = relation.id, unit = %unit, error = %e, "Skipping unreadable unit");
                        continue;
                    }
                };
                mappings.push(UnitCsrMapping {
                    relation_id: relation.id,
                    application_name: application_name.clone(),
                    unit_name: unit.clone(),
                    unit_csrs,
                });
            }
        }
        mappings
    }

    /// Per-unit CSRs that have no matching certificate issued yet
    pub fn get_outstanding_certificate_requests(
        &self,
        relation_id: Option<RelationId>,
    ) -> Vec<UnitCsrMapping> {
        let issued = self.get_issued_certificates(relation_id);
        self.get_requirer_csrs(relation_id)
            .into_iter()
            .filter_map(|mut mapping| {
                mapping.unit_csrs.retain(|request| {
                    !issued_for_csr(&issued, &mapping.application_name, &request.csr)
                });
                (!mapping.unit_csrs.is_empty()).then_some(mapping)
            })
            .collect()
    }

    /// Whether a valid certificate was issued to `app_name` for `csr`
    pub fn certificate_issued_for_csr(
        &self,
        app_name: &str,
        csr: &str,
        relation_id: Option<RelationId>,
    ) -> bool {
        issued_for_csr(&self.get_issued_certificates(relation_id), app_name, csr)
    }
}

fn issued_for_csr(
    issued: &BTreeMap<String, Vec<IssuedCertificateSummary>>,
    app_name: &str,
    csr: &str,
) -> bool {
    issued
        .get(app_name)
        .and_then(|pairs| pairs.iter().find(|pair| pair.csr == csr))
        .is_some_and(|pair| csr_matches_certificate(csr, &pair.certificate))
}
