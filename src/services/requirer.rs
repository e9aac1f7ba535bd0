//! Requirer side of the certificate lifecycle
//!
//! A requirer unit publishes CSRs in its own databag and watches the
//! provider's certificate list. Expiry is tracked through the host's secret
//! store when one is available, otherwise through periodic checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::CertificatesConfig;
use crate::models::{
    InvalidationReason, ProviderCertificate, Relation, RequirerCsr, RequirerEvent,
};
use crate::services::certificate_store::CertificateStore;
use crate::services::clock::{Clock, SystemClock};
use crate::services::relation_store::RelationStore;
use crate::services::secrets::{csr_from_label, secret_label, SecretStore, SECRET_CERTIFICATE_KEY};
use crate::services::x509::{closest_future_time_at, get_certificate_expiry_time};
use crate::utils::error::{TlsError, TlsResult};
use crate::LIBRARY_ID;

/// Default lead time before expiry for the expiring notification
pub const DEFAULT_EXPIRY_NOTIFICATION_HOURS: i64 = 168;

/// Certificate requirer bound to one relation endpoint
pub struct TlsCertificatesRequirer<S: RelationStore> {
    store: S,
    relation_name: String,
    expiry_notification_window: Duration,
    secret_label_prefix: String,
    secrets: Option<Box<dyn SecretStore>>,
    use_secrets: bool,
    clock: Box<dyn Clock>,
}

impl<S: RelationStore> TlsCertificatesRequirer<S> {
    /// Requirer with the default window, the system clock and no secret store
    pub fn new(store: S, relation_name: impl Into<String>) -> Self {
        Self {
            store,
            relation_name: relation_name.into(),
            expiry_notification_window: Duration::hours(DEFAULT_EXPIRY_NOTIFICATION_HOURS),
            secret_label_prefix: LIBRARY_ID.to_string(),
            secrets: None,
            use_secrets: true,
            clock: Box::new(SystemClock),
        }
    }

    /// Requirer configured from the `certificates` config section
    pub fn from_config(store: S, config: &CertificatesConfig) -> Self {
        Self::new(store, config.relation_name.clone())
            .with_expiry_notification_window(config.expiry_notification_window())
            .with_secret_label_prefix(config.secret_label_prefix.clone())
            .with_use_secrets(config.use_secrets)
    }

    pub fn with_expiry_notification_window(mut self, window: Duration) -> Self {
        self.expiry_notification_window = window;
        self
    }

    pub fn with_secret_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.secret_label_prefix = prefix.into();
        self
    }

    /// Track expiry through secret expiry callbacks
    pub fn with_secret_store(mut self, secrets: impl SecretStore + 'static) -> Self {
        self.secrets = Some(Box::new(secrets));
        self
    }

    /// With `false`, a configured secret store is left untouched and expiry
    /// is tracked by [`Self::on_update_status`]
    pub fn with_use_secrets(mut self, use_secrets: bool) -> Self {
        self.use_secrets = use_secrets;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn expiry_notification_window(&self) -> Duration {
        self.expiry_notification_window
    }

    /// Whether expiry is tracked through secret callbacks
    pub fn uses_secrets(&self) -> bool {
        self.secrets().is_some()
    }

    fn secrets(&self) -> Option<&dyn SecretStore> {
        self.secrets.as_deref().filter(|_| self.use_secrets)
    }

    /// Label of the secret caching the certificate for `csr`
    pub fn secret_label(&self, csr: &str) -> String {
        secret_label(&self.secret_label_prefix, csr)
    }

    fn certificates(&self) -> CertificateStore<'_, S> {
        CertificateStore::new(&self.store)
    }

    fn relation(&self) -> TlsResult<Relation> {
        self.store
            .get_relation(&self.relation_name, None)
            .ok_or_else(|| TlsError::RelationNotFound(self.relation_name.clone()))
    }

    /// CSRs in our own unit databag
    pub fn requirer_csrs(&self) -> TlsResult<Vec<RequirerCsr>> {
        let relation = self.relation()?;
        self.certificates().own_requirer_csrs(relation.id)
    }

    /// Certificates listed by the provider
    ///
    /// Empty when the relation or the provider document is absent or invalid.
    /// A provider databag the store cannot read is an error.
    pub fn provider_certificates(&self) -> TlsResult<Vec<ProviderCertificate>> {
        let Some(relation) = self.store.get_relation(&self.relation_name, None) else {
            debug!(relation = %self.relation_name, "No relation");
            return Ok(Vec::new());
        };
        let Some(app) = relation.app.as_deref() else {
            debug!(relation = %self.relation_name, "No remote app in relation");
            return Ok(Vec::new());
        };
        self.certificates().load_provider_certificates(relation.id, app)
    }

    fn find_certificate(&self, csr: &str) -> TlsResult<Option<ProviderCertificate>> {
        Ok(self
            .provider_certificates()?
            .into_iter()
            .find(|certificate| certificate.csr == csr))
    }

    /// Ask the provider for a certificate
    pub fn request_certificate_creation(
        &self,
        certificate_signing_request: &str,
        is_ca: bool,
    ) -> TlsResult<()> {
        let relation = self.relation()?;
        self.certificates()
            .add_requirer_csr(relation.id, certificate_signing_request.trim(), is_ca)?;
        info!(relation_id = relation.id, "Certificate request sent to provider");
        Ok(())
    }

    /// Withdraw a CSR; the provider revokes whatever it issued for it
    pub fn request_certificate_revocation(&self, certificate_signing_request: &str) -> TlsResult<()> {
        let relation = self.relation()?;
        self.certificates()
            .remove_requirer_csr(relation.id, certificate_signing_request.trim())?;
        info!(relation_id = relation.id, "Certificate revocation sent to provider");
        Ok(())
    }

    /// Swap an old CSR for a new one
    ///
    /// A missing relation while withdrawing the old CSR is only logged, so the
    /// new CSR is always requested.
    pub fn request_certificate_renewal(
        &self,
        old_certificate_signing_request: &str,
        new_certificate_signing_request: &str,
    ) -> TlsResult<()> {
        if let Err(e) = self.request_certificate_revocation(old_certificate_signing_request) {
            if !e.is_relation_not_found() {
                return Err(e);
            }
            warn!(error = %e, "Certificate revocation failed");
        }
        self.request_certificate_creation(new_certificate_signing_request, false)?;
        info!("Certificate renewal request completed");
        Ok(())
    }

    /// Our CSRs, optionally only those with or without a certificate
    pub fn get_certificate_signing_requests(
        &self,
        fulfilled_only: bool,
        unfulfilled_only: bool,
    ) -> TlsResult<Vec<RequirerCsr>> {
        let provided = self.provider_certificates()?;
        let csrs = self
            .requirer_csrs()?
            .into_iter()
            .filter(|request| {
                let fulfilled = provided.iter().any(|c| c.csr == request.csr);
                !((unfulfilled_only && fulfilled) || (fulfilled_only && !fulfilled))
            })
            .collect();
        Ok(csrs)
    }

    /// Certificates issued for our CSRs
    pub fn get_assigned_certificates(&self) -> TlsResult<Vec<ProviderCertificate>> {
        let provided = self.provider_certificates()?;
        let assigned = self
            .get_certificate_signing_requests(true, false)?
            .into_iter()
            .filter_map(|request| provided.iter().find(|c| c.csr == request.csr).cloned())
            .collect();
        Ok(assigned)
    }

    /// Our certificates that are inside the notification window or expired
    ///
    /// Certificates whose expiry cannot be read are left out.
    pub fn get_expiring_certificates(&self) -> TlsResult<Vec<ProviderCertificate>> {
        let now = self.clock.now();
        let expiring = self
            .get_assigned_certificates()?
            .into_iter()
            .filter(|certificate| {
                get_certificate_expiry_time(&certificate.certificate)
                    .is_some_and(|expiry| now > expiry - self.expiry_notification_window)
            })
            .collect();
        Ok(expiring)
    }

    /// When the secret for `certificate` should next fire
    pub fn next_secret_expiry_time(&self, certificate: &str) -> Option<DateTime<Utc>> {
        let expiry = get_certificate_expiry_time(certificate)?;
        Some(closest_future_time_at(
            expiry - self.expiry_notification_window,
            expiry,
            self.clock.now(),
        ))
    }

    /// Re-evaluate after the provider changed its certificate list
    pub fn on_relation_changed(&self) -> TlsResult<Vec<RequirerEvent>> {
        let requested: Vec<String> = self
            .requirer_csrs()?
            .into_iter()
            .map(|request| request.csr)
            .collect();

        let mut events = Vec::new();
        for certificate in self.provider_certificates()? {
            if !requested.contains(&certificate.csr) {
                continue;
            }
            let label = self.secret_label(&certificate.csr);
            if certificate.revoked {
                if let Some(secrets) = self.secrets() {
                    secrets.purge(&label)?;
                }
                info!("Certificate revoked by provider");
                events.push(RequirerEvent::invalidated(
                    InvalidationReason::Revoked,
                    &certificate,
                ));
            } else {
                if let Some(secrets) = self.secrets() {
                    self.cache_certificate(secrets, &label, &certificate.certificate)?;
                }
                info!("Certificate available");
                events.push(RequirerEvent::available(&certificate));
            }
        }
        Ok(events)
    }

    fn cache_certificate(
        &self,
        secrets: &dyn SecretStore,
        label: &str,
        certificate: &str,
    ) -> TlsResult<()> {
        let content = BTreeMap::from([(
            SECRET_CERTIFICATE_KEY.to_string(),
            certificate.to_string(),
        )]);
        let expire_at = self.next_secret_expiry_time(certificate);
        if secrets.get(label).is_some() {
            secrets.update(label, content)?;
            secrets.set_expiry(label, expire_at)
        } else {
            secrets.add(label, content, expire_at)
        }
    }

    /// The relation is gone along with every certificate it carried
    pub fn on_relation_broken(&self) -> Vec<RequirerEvent> {
        vec![RequirerEvent::AllCertificatesInvalidated]
    }

    /// Handle an expiry callback for one of our secrets
    ///
    /// Before the certificate's expiry this emits an expiring notification and
    /// moves the callback to the expiry instant. At or after expiry it emits an
    /// invalidation, withdraws the CSR and drops the secret.
    pub fn on_secret_expired(&self, label: &str) -> TlsResult<Vec<RequirerEvent>> {
        let Some(secrets) = self.secrets() else {
            return Ok(Vec::new());
        };
        let Some(csr) = csr_from_label(&self.secret_label_prefix, label) else {
            return Ok(Vec::new());
        };

        let Some(certificate) = self.find_certificate(csr)? else {
            debug!(label, "Secret expired with no matching certificate, cleaning up");
            secrets.purge(label)?;
            return Ok(Vec::new());
        };
        let Some(expiry) = get_certificate_expiry_time(&certificate.certificate) else {
            debug!(label, "Secret expired but certificate is invalid, cleaning up");
            secrets.purge(label)?;
            return Ok(Vec::new());
        };

        if self.clock.now() < expiry {
            warn!(%expiry, "Certificate almost expired");
            secrets.set_expiry(label, Some(expiry))?;
            return Ok(vec![RequirerEvent::CertificateExpiring {
                certificate: certificate.certificate,
                expiry,
            }]);
        }

        warn!(%expiry, "Certificate is expired");
        let events = vec![RequirerEvent::invalidated(
            InvalidationReason::Expired,
            &certificate,
        )];
        self.withdraw_expired(&certificate.csr)?;
        secrets.purge(label)?;
        Ok(events)
    }

    /// Periodic expiry check, used when expiry is not tracked through secrets
    pub fn on_update_status(&self) -> TlsResult<Vec<RequirerEvent>> {
        if self.uses_secrets() {
            return Ok(Vec::new());
        }
        let requested = match self.requirer_csrs() {
            Ok(csrs) => csrs,
            Err(e) if e.is_relation_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let mut events = Vec::new();
        for certificate in self.provider_certificates()? {
            if certificate.revoked || !requested.iter().any(|r| r.csr == certificate.csr) {
                continue;
            }
            let Some(expiry) = get_certificate_expiry_time(&certificate.certificate) else {
                continue;
            };
            let remaining = expiry - now;
            if remaining < Duration::zero() {
                warn!(%expiry, "Certificate is expired");
                events.push(RequirerEvent::invalidated(
                    InvalidationReason::Expired,
                    &certificate,
                ));
                self.withdraw_expired(&certificate.csr)?;
            } else if remaining < self.expiry_notification_window {
                warn!(%expiry, "Certificate almost expired");
                events.push(RequirerEvent::CertificateExpiring {
                    certificate: certificate.certificate,
                    expiry,
                });
            }
        }
        Ok(events)
    }

    fn withdraw_expired(&self, csr: &str) -> TlsResult<()> {
        match self.request_certificate_revocation(csr) {
            Err(e) if e.is_relation_not_found() => {
                warn!(error = %e, "Could not withdraw expired CSR");
                Ok(())
            }
            other => other,
        }
    }
}
