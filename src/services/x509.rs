//! X.509 primitives
//!
//! Key, CSR, CA and leaf certificate generation plus the read-only helpers the
//! lifecycle code relies on. Generation fails loudly on bad keys or
//! passwords. The matching and expiry helpers never fail: malformed PEM is
//! logged and answered with `false` or `None`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509NameRef, X509Ref, X509Req, X509};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;
use x509_parser::prelude::*;

use crate::utils::error::{TlsError, TlsResult};
use crate::utils::validation::{validate_country_code, validate_oid};

const X509_VERSION_3: i32 = 2;
const X509_REQ_VERSION_1: i32 = 0;
const SERIAL_BITS: i32 = 128;

pub const DEFAULT_KEY_SIZE: u32 = 2048;
pub const DEFAULT_PUBLIC_EXPONENT: u32 = 65537;
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
pub const DEFAULT_COUNTRY: &str = "US";

const OID_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_KEY_USAGE: &str = "2.5.29.15";
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";
const OID_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

/// Generate an RSA private key, PEM PKCS#1, optionally AES-256 encrypted
pub fn generate_private_key(
    password: Option<&[u8]>,
    key_size: u32,
    public_exponent: u32,
) -> TlsResult<String> {
    if key_size < 1024 {
        return Err(TlsError::InvalidInput(format!(
            "Key size {} is below the 1024 bit minimum",
            key_size
        )));
    }
    if public_exponent < 3 || public_exponent % 2 == 0 {
        return Err(TlsError::InvalidInput(format!(
            "Public exponent {} must be odd and at least 3",
            public_exponent
        )));
    }

    let exponent = BigNum::from_u32(public_exponent)?;
    let rsa = Rsa::generate_with_e(key_size, &exponent)?;
    let pem = match password.filter(|pw| !pw.is_empty()) {
        Some(pw) => rsa.private_key_to_pem_passphrase(Cipher::aes_256_cbc(), pw)?,
        None => rsa.private_key_to_pem()?,
    };
    pem_to_string(pem)
}

/// Load a PEM private key, decrypting it when a password is given
pub fn load_private_key(pem: &str, password: Option<&[u8]>) -> TlsResult<PKey<Private>> {
    let key = match password {
        Some(pw) => PKey::private_key_from_pem_passphrase(pem.as_bytes(), pw)?,
        None => PKey::private_key_from_pem(pem.as_bytes())?,
    };
    Ok(key)
}

/// Builder for PKCS#10 certificate signing requests
///
/// ```rust,no_run
/// # use tls_certificates_interface::services::x509::{generate_private_key, CsrBuilder};
/// # fn example() -> tls_certificates_interface::TlsResult<()> {
/// let key = generate_private_key(None, 2048, 65537)?;
/// let csr = CsrBuilder::new(&key, "db.example.com")
///     .sans_dns(vec!["db.example.com".to_string()])
///     .sans_ip(vec!["10.0.0.4".to_string()])
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CsrBuilder<'a> {
    private_key: &'a str,
    private_key_password: Option<&'a [u8]>,
    subject: String,
    add_unique_id: bool,
    organization: Option<String>,
    email_address: Option<String>,
    country_name: Option<String>,
    sans: Vec<String>,
    sans_dns: Vec<String>,
    sans_ip: Vec<String>,
    sans_oid: Vec<String>,
    additional_critical_extensions: Vec<(String, Vec<u8>)>,
}

impl<'a> CsrBuilder<'a> {
    /// Start a request for `subject`, used as the common name
    pub fn new(private_key: &'a str, subject: impl Into<String>) -> Self {
        Self {
            private_key,
            private_key_password: None,
            subject: subject.into(),
            add_unique_id: true,
            organization: None,
            email_address: None,
            country_name: None,
            sans: Vec::new(),
            sans_dns: Vec::new(),
            sans_ip: Vec::new(),
            sans_oid: Vec::new(),
            additional_critical_extensions: Vec::new(),
        }
    }

    pub fn private_key_password(mut self, password: &'a [u8]) -> Self {
        self.private_key_password = Some(password);
        self
    }

    /// Append a random x500UniqueIdentifier to the subject (default on)
    ///
    /// Leave this on for CSRs sent over the relation: two units asking for the
    /// same common name would otherwise produce identical requests.
    pub fn add_unique_id(mut self, enabled: bool) -> Self {
        self.add_unique_id = enabled;
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn email_address(mut self, email: impl Into<String>) -> Self {
        self.email_address = Some(email.into());
        self
    }

    pub fn country_name(mut self, country: impl Into<String>) -> Self {
        self.country_name = Some(country.into());
        self
    }

    /// DNS names, older alias of [`CsrBuilder::sans_dns`]
    pub fn sans(mut self, names: Vec<String>) -> Self {
        self.sans = names;
        self
    }

    pub fn sans_dns(mut self, names: Vec<String>) -> Self {
        self.sans_dns = names;
        self
    }

    pub fn sans_ip(mut self, addresses: Vec<String>) -> Self {
        self.sans_ip = addresses;
        self
    }

    /// Registered-ID names as dotted OIDs
    pub fn sans_oid(mut self, oids: Vec<String>) -> Self {
        self.sans_oid = oids;
        self
    }

    /// Extra critical extensions as `(dotted OID, DER-encoded value)` pairs
    pub fn additional_critical_extensions(mut self, extensions: Vec<(String, Vec<u8>)>) -> Self {
        self.additional_critical_extensions = extensions;
        self
    }

    /// Sign the request with SHA-256 and return it as PEM
    pub fn build(self) -> TlsResult<String> {
        let signing_key = load_private_key(self.private_key, self.private_key_password)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &self.subject)?;
        if self.add_unique_id {
            name.append_entry_by_nid(Nid::X500UNIQUEIDENTIFIER, &Uuid::new_v4().to_string())?;
        }
        if let Some(organization) = self.organization.as_deref().filter(|v| !v.is_empty()) {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
        }
        if let Some(email) = self.email_address.as_deref().filter(|v| !v.is_empty()) {
            name.append_entry_by_nid(Nid::PKCS9_EMAILADDRESS, email)?;
        }
        if let Some(country) = self.country_name.as_deref().filter(|v| !v.is_empty()) {
            if !validate_country_code(country) {
                return Err(TlsError::InvalidInput(format!(
                    "Invalid country code: {}",
                    country
                )));
            }
            name.append_entry_by_nid(Nid::COUNTRYNAME, country)?;
        }
        let name = name.build();

        let mut builder = X509Req::builder()?;
        builder.set_version(X509_REQ_VERSION_1)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(&signing_key)?;

        let mut extensions: Stack<X509Extension> = Stack::new()?;

        let oids = unique(&self.sans_oid);
        let ips = unique(&self.sans_ip);
        let dns = unique(self.sans.iter().chain(self.sans_dns.iter()));
        if !(oids.is_empty() && ips.is_empty() && dns.is_empty()) {
            let mut san = SubjectAlternativeName::new();
            for oid in &oids {
                if !validate_oid(oid) {
                    return Err(TlsError::InvalidInput(format!("Invalid OID: {}", oid)));
                }
                san.rid(oid);
            }
            for ip in &ips {
                let address: IpAddr = ip.parse()?;
                san.ip(&address.to_string());
            }
            for name in &dns {
                san.dns(name);
            }
            extensions.push(san.build(&builder.x509v3_context(None))?)?;
        }

        for (oid, value) in &self.additional_critical_extensions {
            extensions.push(der_extension(oid, true, value)?)?;
        }

        if !extensions.is_empty() {
            builder.add_extensions(&extensions)?;
        }

        builder.sign(&signing_key, MessageDigest::sha256())?;
        pem_to_string(builder.build().to_pem()?)
    }
}

/// Generate a CSR with default options
pub fn generate_csr(private_key: &str, subject: &str) -> TlsResult<String> {
    CsrBuilder::new(private_key, subject).build()
}

/// Generate a self-signed CA certificate
pub fn generate_ca(
    private_key: &str,
    subject: &str,
    private_key_password: Option<&[u8]>,
    validity_days: u32,
    country: &str,
) -> TlsResult<String> {
    if !validate_country_code(country) {
        return Err(TlsError::InvalidInput(format!(
            "Invalid country code: {}",
            country
        )));
    }
    let key = load_private_key(private_key, private_key_password)?;

    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, country)?;
    name.append_entry_by_nid(Nid::COMMONNAME, subject)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let serial = random_serial()?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;

    let subject_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(subject_key_id)?;
    let authority_key_id = AuthorityKeyIdentifier::new()
        .keyid(true)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(authority_key_id)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_cert_sign()
            .build()?,
    )?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;

    builder.sign(&key, MessageDigest::sha256())?;
    pem_to_string(builder.build().to_pem()?)
}

/// An extension carried in a CSR's extensionRequest attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedExtension {
    pub oid: String,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

/// Subject alternative names requested by a CSR
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedNames {
    pub dns: Vec<String>,
    pub ip: Vec<IpAddr>,
    pub registered_ids: Vec<String>,
}

/// Read the extensions and subject alternative names a CSR asks for
pub fn requested_extensions(csr_der: &[u8]) -> TlsResult<(Vec<RequestedExtension>, RequestedNames)> {
    let (_, request) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| TlsError::InvalidInput(format!("Could not parse CSR: {}", e)))?;

    let mut extensions = Vec::new();
    let mut names = RequestedNames::default();

    for attribute in request.certification_request_info.iter_attributes() {
        let ParsedCriAttribute::ExtensionRequest(extension_request) = attribute.parsed_attribute()
        else {
            continue;
        };
        for extension in &extension_request.extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns) => names.dns.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
                            Some(ip) => names.ip.push(ip),
                            None => debug!("Skipping malformed IP address in CSR"),
                        },
                        GeneralName::RegisteredID(oid) => {
                            names.registered_ids.push(oid.to_id_string())
                        }
                        _ => {}
                    }
                }
            }
            extensions.push(RequestedExtension {
                oid: extension.oid.to_id_string(),
                critical: extension.critical,
                value: extension.value.to_vec(),
            });
        }
    }

    Ok((extensions, names))
}

/// Extensions for a certificate issued from `csr` by `ca`
///
/// The provider manages the key identifiers, basic constraints, subject
/// alternative names and, for CA certificates, key usage. Any other extension
/// the CSR requests is carried over. `builder` must already hold the CSR's
/// public key.
pub fn certificate_extensions(
    builder: &X509Builder,
    ca: &X509Ref,
    csr: &X509Req,
    alt_names: &[String],
    is_ca: bool,
) -> TlsResult<Vec<X509Extension>> {
    let (requested, names) = requested_extensions(&csr.to_der()?)?;

    let mut managed = vec![
        OID_AUTHORITY_KEY_IDENTIFIER,
        OID_SUBJECT_KEY_IDENTIFIER,
        OID_BASIC_CONSTRAINTS,
    ];
    let mut extensions = vec![
        AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(ca), None))?,
        SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca), None))?,
    ];
    let mut basic_constraints = BasicConstraints::new();
    basic_constraints.critical();
    if is_ca {
        basic_constraints.ca();
    }
    extensions.push(basic_constraints.build()?);

    let dns = unique(alt_names.iter().chain(names.dns.iter()));
    if !(dns.is_empty() && names.ip.is_empty() && names.registered_ids.is_empty()) {
        let mut san = SubjectAlternativeName::new();
        for name in &dns {
            san.dns(name);
        }
        for ip in &names.ip {
            san.ip(&ip.to_string());
        }
        for oid in &names.registered_ids {
            san.rid(oid);
        }
        extensions.push(san.build(&builder.x509v3_context(Some(ca), None))?);
        managed.push(OID_SUBJECT_ALT_NAME);
    }

    if is_ca {
        extensions.push(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?);
        managed.push(OID_KEY_USAGE);
    }

    for extension in requested {
        if extension.oid == OID_SUBJECT_ALT_NAME {
            continue;
        }
        if managed.contains(&extension.oid.as_str()) {
            warn!(oid = %extension.oid, "Extension is managed by the TLS provider, ignoring");
            continue;
        }
        match der_extension(&extension.oid, extension.critical, &extension.value) {
            Ok(copied) => extensions.push(copied),
            Err(e) => warn!(oid = %extension.oid, error = %e, "Failed to copy CSR extension"),
        }
    }

    Ok(extensions)
}

/// Issue a certificate for `csr`, signed by the CA key
pub fn generate_certificate(
    csr: &str,
    ca: &str,
    ca_key: &str,
    ca_key_password: Option<&[u8]>,
    validity_days: u32,
    alt_names: &[String],
    is_ca: bool,
) -> TlsResult<String> {
    let request = X509Req::from_pem(csr.as_bytes())?;
    let ca_cert = X509::from_pem(ca.as_bytes())?;
    let signing_key = load_private_key(ca_key, ca_key_password)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let serial = random_serial()?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(request.subject_name())?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    let request_public_key = request.public_key()?;
    builder.set_pubkey(&request_public_key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;
    builder.set_not_after(&not_after)?;

    let extensions = certificate_extensions(&builder, &ca_cert, &request, alt_names, is_ca)?;
    for extension in extensions {
        if let Err(e) = builder.append_extension(extension) {
            warn!(error = %e, "Failed to add extension");
        }
    }

    builder.sign(&signing_key, MessageDigest::sha256())?;
    pem_to_string(builder.build().to_pem()?)
}

/// Bundle a certificate and its key into a password-protected PKCS#12 archive
pub fn generate_pfx_package(
    certificate: &str,
    private_key: &str,
    package_password: &str,
    private_key_password: Option<&[u8]>,
) -> TlsResult<Vec<u8>> {
    let key = load_private_key(private_key, private_key_password)?;
    let cert = X509::from_pem(certificate.as_bytes())?;
    let name = rfc4514_name(cert.subject_name())?;

    let pkcs12 = Pkcs12::builder()
        .name(&name)
        .pkey(&key)
        .cert(&cert)
        .build2(package_password)?;
    Ok(pkcs12.to_der()?)
}

/// Whether `cert` was issued for the key pair behind `csr`
///
/// Compares the SubjectPublicKeyInfo encodings and, for RSA keys, the moduli.
pub fn csr_matches_certificate(csr: &str, cert: &str) -> bool {
    match compare_public_keys(csr, cert) {
        Ok(matches) => matches,
        Err(e) => {
            warn!(error = %e, "Could not load certificate or CSR");
            false
        }
    }
}

fn compare_public_keys(csr: &str, cert: &str) -> TlsResult<bool> {
    let csr_key = X509Req::from_pem(csr.as_bytes())?.public_key()?;
    let cert_key = X509::from_pem(cert.as_bytes())?.public_key()?;

    if csr_key.public_key_to_pem()? != cert_key.public_key_to_pem()? {
        return Ok(false);
    }
    if csr_key.id() == Id::RSA {
        return Ok(csr_key.rsa()?.n() == cert_key.rsa()?.n());
    }
    Ok(true)
}

/// The certificate's "not valid after" instant, `None` if it cannot be read
pub fn get_certificate_expiry_time(certificate: &str) -> Option<DateTime<Utc>> {
    let expiry = X509::from_pem(certificate.as_bytes())
        .map_err(TlsError::from)
        .and_then(|cert| asn1_to_datetime(cert.not_after()));
    match expiry {
        Ok(expiry) => Some(expiry),
        Err(e) => {
            warn!(error = %e, "Could not load certificate");
            None
        }
    }
}

/// `notification_time` while it is still ahead of `now`, else `expiry_time`
pub fn closest_future_time_at(
    notification_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if now < notification_time {
        notification_time
    } else {
        expiry_time
    }
}

/// [`closest_future_time_at`] against the system clock
pub fn closest_future_time(
    notification_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
) -> DateTime<Utc> {
    closest_future_time_at(notification_time, expiry_time, Utc::now())
}

/// SHA-256 fingerprint of a PEM certificate, lowercase hex
pub fn certificate_fingerprint(certificate: &str) -> TlsResult<String> {
    let cert = X509::from_pem(certificate.as_bytes())?;
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(hex::encode(&*digest))
}

/// Summary of a certificate for operator output
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub subject_alt_names: Vec<String>,
    pub fingerprint_sha256: String,
}

/// Describe a PEM certificate
pub fn describe_certificate(certificate: &str) -> TlsResult<CertificateInfo> {
    let (_, pem) = parse_x509_pem(certificate.as_bytes())
        .map_err(|e| TlsError::InvalidInput(format!("Could not read PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| TlsError::InvalidInput(format!("Could not parse certificate: {}", e)))?;

    let mut is_ca = false;
    let mut subject_alt_names = Vec::new();
    for extension in cert.extensions() {
        match extension.parsed_extension() {
            ParsedExtension::BasicConstraints(constraints) => is_ca = constraints.ca,
            ParsedExtension::SubjectAlternativeName(san) => {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(dns) => subject_alt_names.push(format!("DNS:{}", dns)),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                subject_alt_names.push(format!("IP:{}", ip));
                            }
                        }
                        GeneralName::RegisteredID(oid) => {
                            subject_alt_names.push(format!("RID:{}", oid.to_id_string()))
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let validity = cert.validity();
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
        is_ca,
        subject_alt_names,
        fingerprint_sha256: certificate_fingerprint(certificate)?,
    })
}

fn random_serial() -> TlsResult<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

fn der_extension(oid: &str, critical: bool, value: &[u8]) -> TlsResult<X509Extension> {
    if !validate_oid(oid) {
        return Err(TlsError::InvalidInput(format!("Invalid OID: {}", oid)));
    }
    let object = Asn1Object::from_str(oid)?;
    let contents = Asn1OctetString::new_from_bytes(value)?;
    Ok(X509Extension::new_from_der(&object, critical, &contents)?)
}

fn asn1_to_datetime(time: &Asn1TimeRef) -> TlsResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    timestamp(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

fn timestamp(seconds: i64) -> TlsResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| TlsError::Crypto(format!("Timestamp out of range: {}", seconds)))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn rfc4514_name(name: &X509NameRef) -> TlsResult<String> {
    let mut parts = Vec::new();
    for entry in name.entries() {
        let key = entry.object().nid().short_name()?;
        let value = entry.data().to_string()?;
        parts.push(format!("{}={}", key, value));
    }
    parts.reverse();
    Ok(parts.join(","))
}

fn unique<'s>(values: impl IntoIterator<Item = &'s String>) -> Vec<&'s String> {
    let mut seen: Vec<&String> = Vec::new();
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

fn pem_to_string(pem: Vec<u8>) -> TlsResult<String> {
    String::from_utf8(pem).map_err(|e| TlsError::Crypto(format!("PEM output is not UTF-8: {}", e)))
}
