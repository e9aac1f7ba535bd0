//! Test fixtures for common test data
//!
//! Key generation is the slow part, so the CA is created once per test binary.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use tls_certificates_interface::models::RelationId;
use tls_certificates_interface::ProviderEvent;
use tls_certificates_interface::services::x509::{
    generate_ca, generate_certificate, generate_csr, generate_private_key,
    get_certificate_expiry_time,
};
use tls_certificates_interface::services::{
    InMemoryRelationStore, InMemorySecretStore, ManualClock, TlsCertificatesProvider,
    TlsCertificatesRequirer,
};

pub const RELATION: &str = "certificates";
pub const PROVIDER_APP: &str = "provider";
pub const REQUIRER_APP: &str = "requirer";

/// Signing material shared by every test in the binary
pub struct TestCa {
    pub key: String,
    pub certificate: String,
}

pub static CA: Lazy<TestCa> = Lazy::new(|| {
    let key = generate_private_key(None, 2048, 65537).expect("CA key");
    let certificate = generate_ca(&key, "Test CA", None, 3650, "US").expect("CA certificate");
    TestCa { key, certificate }
});

/// A fresh private key and a CSR for `subject`
pub fn key_and_csr(subject: &str) -> (String, String) {
    let key = generate_private_key(None, 2048, 65537).expect("private key");
    let csr = generate_csr(&key, subject).expect("CSR");
    (key, csr)
}

pub fn new_csr(subject: &str) -> String {
    key_and_csr(subject).1
}

/// Sign `csr` with the test CA
pub fn sign(csr: &str, validity_days: u32) -> String {
    generate_certificate(csr, &CA.certificate, &CA.key, None, validity_days, &[], false)
        .expect("certificate")
}

pub fn expiry_of(certificate: &str) -> DateTime<Utc> {
    get_certificate_expiry_time(certificate).expect("readable expiry")
}

/// A provider leader and requirer units joined on one relation
pub struct Deployment {
    pub provider: TlsCertificatesProvider<InMemoryRelationStore>,
    pub world: InMemoryRelationStore,
    pub relation_id: RelationId,
    pub clock: ManualClock,
}

impl Deployment {
    pub fn new() -> Self {
        let world = InMemoryRelationStore::new("provider/0", true);
        let relation_id = world.add_relation(RELATION, PROVIDER_APP, REQUIRER_APP);
        world.add_unit(relation_id, "provider/0").expect("provider unit");
        Self {
            provider: TlsCertificatesProvider::new(world.clone(), RELATION),
            world,
            relation_id,
            clock: ManualClock::new(Utc::now()),
        }
    }

    /// Join a requirer unit that tracks expiry through `secrets`
    pub fn requirer_with_secrets(
        &self,
        unit: &str,
        leader: bool,
        secrets: &InMemorySecretStore,
    ) -> TlsCertificatesRequirer<InMemoryRelationStore> {
        self.requirer(unit, leader).with_secret_store(secrets.clone())
    }

    /// Join a requirer unit that relies on periodic checks
    pub fn requirer(
        &self,
        unit: &str,
        leader: bool,
    ) -> TlsCertificatesRequirer<InMemoryRelationStore> {
        let store = self.world.participant(unit, leader);
        store.add_unit(self.relation_id, unit).expect("requirer unit");
        TlsCertificatesRequirer::new(store, RELATION).with_clock(self.clock.clone())
    }

    /// Sign every outstanding request the provider sees for `unit`
    pub fn fulfil(&self, unit: &str, validity_days: u32) -> Vec<String> {
        let events = self
            .provider
            .on_relation_changed(self.relation_id, Some(unit))
            .expect("provider relation changed");
        let mut issued = Vec::new();
        for event in events {
            if let ProviderEvent::CertificateCreationRequest {
                certificate_signing_request,
                relation_id,
                ..
            } = event
            {
                let certificate = sign(&certificate_signing_request, validity_days);
                self.provider
                    .set_relation_certificate(
                        &certificate,
                        &certificate_signing_request,
                        &CA.certificate,
                        &[CA.certificate.clone()],
                        relation_id,
                    )
                    .expect("set certificate");
                issued.push(certificate);
            }
        }
        issued
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}
