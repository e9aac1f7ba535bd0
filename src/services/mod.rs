//! Certificate lifecycle services

pub mod certificate_store;
pub mod clock;
pub mod provider;
pub mod relation_store;
pub mod requirer;
pub mod secrets;
pub mod x509;

pub use certificate_store::CertificateStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use provider::TlsCertificatesProvider;
pub use relation_store::{InMemoryRelationStore, RelationStore};
pub use requirer::TlsCertificatesRequirer;
pub use secrets::{InMemorySecretStore, SecretEntry, SecretStore};
pub use x509::{CertificateInfo, CsrBuilder};
