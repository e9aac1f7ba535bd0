//! Requirer-side behaviour: availability, expiry tracking and revocation

use chrono::Duration;

use tls_certificates_interface::config::CertificatesConfig;
use tls_certificates_interface::services::{Clock, InMemorySecretStore, SecretStore};
use tls_certificates_interface::{InvalidationReason, RequirerEvent, TlsCertificatesRequirer};

use crate::common::*;

const WINDOW_HOURS: i64 = 168;

#[test]
fn test_available_certificate_is_cached_until_notification_time() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    let certificate = deployment.fulfil("requirer/0", 30).remove(0);

    let events = requirer.on_relation_changed().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RequirerEvent::CertificateAvailable { certificate_signing_request, .. }
            if certificate_signing_request == csr.trim()
    ));

    let entry = secrets.entry(&requirer.secret_label(csr.trim())).unwrap();
    assert_eq!(entry.content["certificate"], certificate.trim());
    assert_eq!(
        entry.expire_at,
        Some(expiry_of(&certificate) - Duration::hours(WINDOW_HOURS))
    );
}

#[test]
fn test_reissued_certificate_updates_cached_secret() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    deployment.fulfil("requirer/0", 30);
    requirer.on_relation_changed().unwrap();

    let replacement = sign(&csr, 3);
    deployment
        .provider
        .set_relation_certificate(&replacement, &csr, &CA.certificate, &[], deployment.relation_id)
        .unwrap();
    requirer.on_relation_changed().unwrap();

    let entry = secrets.entry(&requirer.secret_label(csr.trim())).unwrap();
    assert_eq!(entry.content["certificate"], replacement.trim());
    // Already inside the window, so the alarm moves to the expiry itself
    assert_eq!(entry.expire_at, Some(expiry_of(&replacement)));
    assert_eq!(secrets.len(), 1);
}

#[test]
fn test_expiring_notification_ten_hours_before_expiry() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    let certificate = deployment.fulfil("requirer/0", 30).remove(0);
    requirer.on_relation_changed().unwrap();

    let expiry = expiry_of(&certificate);
    deployment.clock.set(expiry - Duration::hours(10));
    let label = requirer.secret_label(csr.trim());

    let events = requirer.on_secret_expired(&label).unwrap();
    assert_eq!(
        events,
        vec![RequirerEvent::CertificateExpiring {
            certificate: certificate.trim().to_string(),
            expiry,
        }]
    );
    assert_eq!(secrets.entry(&label).unwrap().expire_at, Some(expiry));
}

#[test]
fn test_expired_certificate_invalidated_and_withdrawn() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    let certificate = deployment.fulfil("requirer/0", 30).remove(0);
    requirer.on_relation_changed().unwrap();

    deployment.clock.set(expiry_of(&certificate) + Duration::minutes(1));
    let label = requirer.secret_label(csr.trim());
    let events = requirer.on_secret_expired(&label).unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RequirerEvent::CertificateInvalidated { reason: InvalidationReason::Expired, .. }
    ));
    assert!(secrets.get(&label).is_none());
    assert!(requirer.requirer_csrs().unwrap().is_empty());
}

#[test]
fn test_secret_for_vanished_certificate_is_removed() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let label = requirer.secret_label("csr-that-was-never-issued");
    secrets
        .add(&label, Default::default(), Some(deployment.clock.now()))
        .unwrap();

    assert!(requirer.on_secret_expired(&label).unwrap().is_empty());
    assert!(secrets.is_empty());
}

#[test]
fn test_revoked_certificate_invalidated_and_secret_removed() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let requirer = deployment.requirer_with_secrets("requirer/0", true, &secrets);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    deployment.fulfil("requirer/0", 30);
    requirer.on_relation_changed().unwrap();
    assert_eq!(secrets.len(), 1);

    deployment.provider.revoke_all_certificates().unwrap();
    let events = requirer.on_relation_changed().unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RequirerEvent::CertificateInvalidated { reason: InvalidationReason::Revoked, .. }
    ));
    assert!(secrets.is_empty());
}

#[test]
fn test_periodic_checks_without_secret_store() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    let certificate = deployment.fulfil("requirer/0", 30).remove(0);
    let expiry = expiry_of(&certificate);

    assert!(requirer.on_update_status().unwrap().is_empty());
    assert!(requirer.get_expiring_certificates().unwrap().is_empty());

    deployment.clock.set(expiry - Duration::hours(10));
    let events = requirer.on_update_status().unwrap();
    assert!(matches!(
        events.as_slice(),
        [RequirerEvent::CertificateExpiring { expiry: at, .. }] if *at == expiry
    ));
    assert_eq!(requirer.get_expiring_certificates().unwrap().len(), 1);

    deployment.clock.set(expiry + Duration::hours(1));
    let events = requirer.on_update_status().unwrap();
    assert!(matches!(
        events.as_slice(),
        [RequirerEvent::CertificateInvalidated { reason: InvalidationReason::Expired, .. }]
    ));
    assert!(requirer.requirer_csrs().unwrap().is_empty());
}

#[test]
fn test_disabled_secrets_fall_back_to_periodic_checks() {
    let deployment = Deployment::new();
    let secrets = InMemorySecretStore::new();
    let config = CertificatesConfig {
        use_secrets: false,
        ..CertificatesConfig::default()
    };
    let store = deployment.world.participant("requirer/0", true);
    store.add_unit(deployment.relation_id, "requirer/0").unwrap();
    let requirer = TlsCertificatesRequirer::from_config(store, &config)
        .with_secret_store(secrets.clone())
        .with_clock(deployment.clock.clone());
    assert!(!requirer.uses_secrets());

    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();
    let certificate = deployment.fulfil("requirer/0", 30).remove(0);
    let expiry = expiry_of(&certificate);

    assert_eq!(requirer.on_relation_changed().unwrap().len(), 1);
    let label = requirer.secret_label(csr.trim());
    assert!(secrets.get(&label).is_none());

    deployment.clock.set(expiry - Duration::hours(10));
    assert!(requirer.on_secret_expired(&label).unwrap().is_empty());
    let events = requirer.on_update_status().unwrap();
    assert!(matches!(
        events.as_slice(),
        [RequirerEvent::CertificateExpiring { expiry: at, .. }] if *at == expiry
    ));
}

#[test]
fn test_relation_broken_invalidates_everything() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    deployment.world.remove_relation(deployment.relation_id);

    assert_eq!(
        requirer.on_relation_broken(),
        vec![RequirerEvent::AllCertificatesInvalidated]
    );
    assert!(requirer.provider_certificates().unwrap().is_empty());
    assert!(requirer.requirer_csrs().is_err());
}
