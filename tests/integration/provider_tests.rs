//! Provider-side behaviour with real CSRs

use rstest::rstest;

use tls_certificates_interface::models::{DatabagOwner, ProviderState, PROVIDER_CERTIFICATES_KEY};
use tls_certificates_interface::ProviderEvent;

use crate::common::*;

#[test]
fn test_creation_request_for_new_csr() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();

    let events = deployment
        .provider
        .on_relation_changed(deployment.relation_id, Some("requirer/0"))
        .unwrap();

    assert_eq!(events.len(), 1);
    match &events[0] {
        ProviderEvent::CertificateCreationRequest {
            certificate_signing_request,
            relation_id,
            is_ca,
        } => {
            assert_eq!(certificate_signing_request, csr.trim());
            assert_eq!(*relation_id, deployment.relation_id);
            assert!(!is_ca);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_no_request_once_certificate_is_listed() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    requirer
        .request_certificate_creation(&new_csr("app.example.com"), false)
        .unwrap();
    assert_eq!(deployment.fulfil("requirer/0", 30).len(), 1);

    let events = deployment
        .provider
        .on_relation_changed(deployment.relation_id, Some("requirer/0"))
        .unwrap();
    assert!(events.is_empty());
}

#[test]
fn test_set_relation_certificate_twice_keeps_latest() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();

    let first = sign(&csr, 10);
    let second = sign(&csr, 20);
    for certificate in [&first, &second] {
        deployment
            .provider
            .set_relation_certificate(
                certificate,
                &csr,
                &CA.certificate,
                &[],
                deployment.relation_id,
            )
            .unwrap();
    }

    let bag = deployment.world.databag(
        deployment.relation_id,
        &DatabagOwner::App(PROVIDER_APP.to_string()),
    );
    let state = ProviderState {
        certificates: serde_json::from_str(&bag[PROVIDER_CERTIFICATES_KEY]).unwrap(),
    };
    assert_eq!(state.certificates.len(), 1);
    assert_eq!(state.certificates[0].certificate, second.trim());
}

#[test]
fn test_outstanding_requests_shrink_as_certificates_are_issued() {
    let deployment = Deployment::new();
    let unit0 = deployment.requirer("requirer/0", true);
    let unit1 = deployment.requirer("requirer/1", false);
    unit0
        .request_certificate_creation(&new_csr("zero.example.com"), false)
        .unwrap();
    unit1
        .request_certificate_creation(&new_csr("one.example.com"), false)
        .unwrap();

    let outstanding = deployment
        .provider
        .get_outstanding_certificate_requests(None);
    assert_eq!(outstanding.len(), 2);

    deployment.fulfil("requirer/0", 30);
    let outstanding = deployment
        .provider
        .get_outstanding_certificate_requests(Some(deployment.relation_id));
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].unit_name, "requirer/1");
    assert_eq!(outstanding[0].application_name, REQUIRER_APP);
}

#[test]
fn test_certificate_issued_for_csr_checks_key_pair() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    let csr = new_csr("app.example.com");
    let foreign = sign(&new_csr("app.example.com"), 30);
    requirer.request_certificate_creation(&csr, false).unwrap();

    deployment
        .provider
        .set_relation_certificate(&foreign, &csr, &CA.certificate, &[], deployment.relation_id)
        .unwrap();
    assert!(!deployment
        .provider
        .certificate_issued_for_csr(REQUIRER_APP, csr.trim(), None));

    deployment
        .provider
        .set_relation_certificate(
            &sign(&csr, 30),
            &csr,
            &CA.certificate,
            &[],
            deployment.relation_id,
        )
        .unwrap();
    assert!(deployment
        .provider
        .certificate_issued_for_csr(REQUIRER_APP, csr.trim(), None));
}

#[rstest]
#[case::revoke_all(true)]
#[case::keep(false)]
fn test_revoked_certificates_hidden_from_issued(#[case] revoke: bool) {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    requirer
        .request_certificate_creation(&new_csr("app.example.com"), false)
        .unwrap();
    deployment.fulfil("requirer/0", 30);

    if revoke {
        deployment.provider.revoke_all_certificates().unwrap();
    }

    let issued = deployment.provider.get_issued_certificates(None);
    let expected = if revoke { 0 } else { 1 };
    assert_eq!(issued[REQUIRER_APP].len(), expected);
}

#[test]
fn test_non_leader_provider_is_inert() {
    let deployment = Deployment::new();
    let requirer = deployment.requirer("requirer/0", true);
    let csr = new_csr("app.example.com");
    requirer.request_certificate_creation(&csr, false).unwrap();

    let follower = tls_certificates_interface::TlsCertificatesProvider::new(
        deployment.world.participant("provider/1", false),
        RELATION,
    );
    let events = follower
        .on_relation_changed(deployment.relation_id, Some("requirer/0"))
        .unwrap();
    assert!(events.is_empty());

    follower
        .set_relation_certificate(
            &sign(&csr, 30),
            &csr,
            &CA.certificate,
            &[],
            deployment.relation_id,
        )
        .unwrap();
    assert!(deployment.provider.get_issued_certificates(None)[REQUIRER_APP].is_empty());
}
