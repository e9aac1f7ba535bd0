//! Certificate lifecycle step definitions

use chrono::Duration;
use cucumber::{given, then, when};

use tls_certificates_interface::{InvalidationReason, ProviderEvent, RequirerEvent};

use crate::common::{expiry_of, REQUIRER_APP};
use crate::features::support::TestWorld;

#[given("a provider related to a requirer application")]
async fn provider_related(world: &mut TestWorld) {
    assert!(world
        .deployment
        .provider
        .get_issued_certificates(None)
        .contains_key(REQUIRER_APP));
}

#[given(expr = "requirer unit {string} tracks expiry with secrets")]
async fn tracks_expiry_with_secrets(world: &mut TestWorld, unit: String) {
    world.secret_units.insert(unit);
}

#[given(expr = "requirer unit {string} requests a certificate for {string}")]
async fn request_certificate(world: &mut TestWorld, unit: String, subject: String) {
    let csr = world.csr(&subject);
    world
        .requirer(&unit)
        .request_certificate_creation(&csr, false)
        .expect("CSR published");
}

#[when(expr = "requirer unit {string} withdraws its CSR for {string}")]
async fn withdraw_csr(world: &mut TestWorld, unit: String, subject: String) {
    let csr = world.csr(&subject);
    world
        .requirer(&unit)
        .request_certificate_revocation(&csr)
        .expect("CSR withdrawn");
}

#[when(expr = "requirer unit {string} renews {string} with {string}")]
async fn renew(world: &mut TestWorld, unit: String, old: String, new: String) {
    let old_csr = world.csr(&old);
    let new_csr = world.csr(&new);
    world
        .requirer(&unit)
        .request_certificate_renewal(&old_csr, &new_csr)
        .expect("renewal requested");
}

#[when(expr = "the provider evaluates unit {string}")]
async fn provider_evaluates(world: &mut TestWorld, unit: String) {
    world.provider_events = world
        .deployment
        .provider
        .on_relation_changed(world.deployment.relation_id, Some(&unit))
        .expect("provider evaluation");
}

#[given(expr = "the provider issues certificates valid for {int} days to unit {string}")]
async fn provider_has_issued(world: &mut TestWorld, days: u32, unit: String) {
    issue(world, days, &unit);
}

#[when(expr = "the provider issues certificates valid for {int} days to unit {string}")]
async fn provider_issues(world: &mut TestWorld, days: u32, unit: String) {
    issue(world, days, &unit);
}

fn issue(world: &mut TestWorld, days: u32, unit: &str) {
    let issued = world.deployment.fulfil(unit, days);
    assert!(!issued.is_empty(), "nothing to issue for {}", unit);
    world.issued.extend(issued);
}

#[given(expr = "requirer unit {string} evaluated the relation")]
async fn requirer_evaluated(world: &mut TestWorld, unit: String) {
    evaluate(world, unit);
}

#[when(expr = "requirer unit {string} evaluates the relation")]
async fn requirer_evaluates(world: &mut TestWorld, unit: String) {
    evaluate(world, unit);
}

fn evaluate(world: &mut TestWorld, unit: String) {
    let events = world
        .requirer(&unit)
        .on_relation_changed()
        .expect("requirer evaluation");
    world.requirer_events.insert(unit, events);
}

#[when(expr = "the clock is {int} hours before the certificate for {string} expires")]
async fn clock_before_expiry(world: &mut TestWorld, hours: i64, subject: String) {
    let certificate = world
        .certificate_for(&subject)
        .expect("certificate issued")
        .clone();
    world
        .deployment
        .clock
        .set(expiry_of(&certificate) - Duration::hours(hours));
}

#[when(expr = "the clock passes the expiry of the certificate for {string}")]
async fn clock_after_expiry(world: &mut TestWorld, subject: String) {
    let certificate = world
        .certificate_for(&subject)
        .expect("certificate issued")
        .clone();
    world
        .deployment
        .clock
        .set(expiry_of(&certificate) + Duration::minutes(5));
}

#[when(expr = "the secret for {string} expires on unit {string}")]
async fn secret_expires(world: &mut TestWorld, subject: String, unit: String) {
    let csr = world.csr(&subject);
    let requirer = world.requirer(&unit);
    let label = requirer.secret_label(csr.trim());
    let events = requirer.on_secret_expired(&label).expect("secret expiry handled");
    world.requirer_events.insert(unit, events);
}

#[when(expr = "requirer unit {string} runs its periodic check")]
async fn periodic_check(world: &mut TestWorld, unit: String) {
    let events = world
        .requirer(&unit)
        .on_update_status()
        .expect("periodic check");
    world.requirer_events.insert(unit, events);
}

#[when("the provider revokes all certificates")]
async fn revoke_all(world: &mut TestWorld) {
    world
        .deployment
        .provider
        .revoke_all_certificates()
        .expect("certificates revoked");
}

#[then(expr = "the provider emits {int} creation request(s)")]
async fn creation_requests(world: &mut TestWorld, count: usize) {
    let found = world
        .provider_events
        .iter()
        .filter(|e| matches!(e, ProviderEvent::CertificateCreationRequest { .. }))
        .count();
    assert_eq!(found, count, "events: {:?}", world.provider_events);
}

#[then(expr = "the provider emits {int} revocation request(s)")]
async fn revocation_requests(world: &mut TestWorld, count: usize) {
    let found = world
        .provider_events
        .iter()
        .filter(|e| matches!(e, ProviderEvent::CertificateRevocationRequest { .. }))
        .count();
    assert_eq!(found, count, "events: {:?}", world.provider_events);
}

#[then("the provider lists no certificates")]
async fn provider_lists_none(world: &mut TestWorld) {
    let issued = world.deployment.provider.get_issued_certificates(None);
    assert!(issued.values().all(Vec::is_empty));
}

#[then(expr = "requirer unit {string} receives {int} available certificate(s)")]
async fn receives_available(world: &mut TestWorld, unit: String, count: usize) {
    let events = &world.requirer_events[&unit];
    let found = events
        .iter()
        .filter(|e| matches!(e, RequirerEvent::CertificateAvailable { .. }))
        .count();
    assert_eq!(found, count, "events: {:?}", events);
}

#[then(expr = "requirer unit {string} is warned that {string} expires at its not-after time")]
async fn warned_expiring(world: &mut TestWorld, unit: String, subject: String) {
    let certificate = world
        .certificate_for(&subject)
        .expect("certificate issued")
        .clone();
    let expected = expiry_of(&certificate);
    let events = &world.requirer_events[&unit];
    assert!(
        events.iter().any(|e| matches!(
            e,
            RequirerEvent::CertificateExpiring { certificate: c, expiry }
                if c == certificate.trim() && *expiry == expected
        )),
        "events: {:?}",
        events
    );
}

#[then(expr = "requirer unit {string} is told its certificate was {word}")]
async fn told_invalidated(world: &mut TestWorld, unit: String, reason: String) {
    let reason = match reason.as_str() {
        "revoked" => InvalidationReason::Revoked,
        "expired" => InvalidationReason::Expired,
        other => panic!("unknown reason {}", other),
    };
    let events = &world.requirer_events[&unit];
    assert!(
        events.iter().any(|e| matches!(
            e,
            RequirerEvent::CertificateInvalidated { reason: r, .. } if *r == reason
        )),
        "events: {:?}",
        events
    );
}

#[then(expr = "requirer unit {string} publishes only the CSR for {string}")]
async fn publishes_only(world: &mut TestWorld, unit: String, subject: String) {
    let csr = world.csr(&subject);
    let published = world.requirer(&unit).requirer_csrs().expect("relation present");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].csr, csr.trim());
}

#[then(expr = "requirer unit {string} publishes no CSRs")]
async fn publishes_none(world: &mut TestWorld, unit: String) {
    let published = world.requirer(&unit).requirer_csrs().expect("relation present");
    assert!(published.is_empty(), "published: {:?}", published);
}
