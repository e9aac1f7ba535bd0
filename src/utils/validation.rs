//! Relation payload and input validation utilities
//!
//! The payload validators check structure only. Unknown properties are
//! accepted so newer peers can add fields.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::models::{PROVIDER_CERTIFICATES_KEY, REQUIRER_CSRS_KEY};

/// Regex for dotted-decimal object identifiers
static OID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-2](\.(0|[1-9][0-9]*))+$").unwrap());

/// Regex for ISO 3166 two-letter country codes
static COUNTRY_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}$").unwrap());

/// Validate a requirer unit databag document
///
/// Requires a `certificate_signing_requests` array whose items carry a string
/// `certificate_signing_request` and, optionally, a boolean `ca`.
pub fn validate_requirer_payload(payload: &Value) -> bool {
    let Some(entries) = payload.get(REQUIRER_CSRS_KEY).and_then(Value::as_array) else {
        return false;
    };

    entries.iter().all(|entry| {
        entry.is_object()
            && is_string(entry, "certificate_signing_request")
            && optional_bool(entry, "ca")
    })
}

/// Validate a provider application databag document
///
/// Requires a `certificates` array whose items carry string
/// `certificate_signing_request`, `certificate` and `ca`, a `chain` array of
/// strings and, optionally, a boolean `revoked`.
pub fn validate_provider_payload(payload: &Value) -> bool {
    let Some(entries) = payload
        .get(PROVIDER_CERTIFICATES_KEY)
        .and_then(Value::as_array)
    else {
        return false;
    };

    entries.iter().all(|entry| {
        entry.is_object()
            && is_string(entry, "certificate_signing_request")
            && is_string(entry, "certificate")
            && is_string(entry, "ca")
            && entry
                .get("chain")
                .and_then(Value::as_array)
                .is_some_and(|chain| chain.iter().all(Value::is_string))
            && optional_bool(entry, "revoked")
    })
}

/// Validate a dotted-decimal OID such as `1.2.3.4`
pub fn validate_oid(oid: &str) -> bool {
    OID_REGEX.is_match(oid)
}

/// Validate a two-letter country code
pub fn validate_country_code(country: &str) -> bool {
    COUNTRY_REGEX.is_match(country)
}

fn is_string(entry: &Value, field: &str) -> bool {
    entry.get(field).is_some_and(Value::is_string)
}

fn optional_bool(entry: &Value, field: &str) -> bool {
    entry.get(field).map_or(true, Value::is_boolean)
}
