//! Capability evaluators
//!
//! Each capability reads labels or annotations from the admitted object and
//! either validates them or emits the JSON Patch that applies them. Mutations
//! return `Result<Vec<PatchOperation>, AdmissionError>`; validations return
//! `Result<(), AdmissionError>`. An empty patch means the capability is
//! inactive for the object.

pub mod endpoint_extend;
pub mod fix_pod_ip;
pub mod log_sidecar;

use std::collections::BTreeMap;

use crate::validate::{is_valid_ipv4, is_valid_port, no_duplicates, split_list};
use crate::webhook::{AdmissionError, Source};

/// Example shown in IP list format errors
pub const IP_LIST_EXAMPLE: &str = "192.168.10.10-10.10.10.10";

/// Example shown in port list format errors
pub const PORT_LIST_EXAMPLE: &str = "80-8080";

/// Read a required hyphen-joined IPv4 list from `map`
pub fn ip_list(
    map: Option<&BTreeMap<String, String>>,
    key: &'static str,
    origin: Source,
) -> Result<Vec<String>, AdmissionError> {
    let value = required(map, key, origin)?;
    let tokens = split_list(value);

    if let Some(bad) = tokens.iter().find(|t| !is_valid_ipv4(t)) {
        return Err(AdmissionError::Format {
            origin,
            key,
            token: bad.to_string(),
            example: IP_LIST_EXAMPLE,
        });
    }
    if !no_duplicates(&tokens) {
        return Err(AdmissionError::Duplicate {
            origin,
            key,
            values: tokens.iter().map(|t| t.to_string()).collect(),
            example: IP_LIST_EXAMPLE,
        });
    }

    Ok(tokens.into_iter().map(str::to_string).collect())
}

/// Read a required hyphen-joined port list from `map`
pub fn port_list(
    map: Option<&BTreeMap<String, String>>,
    key: &'static str,
    origin: Source,
) -> Result<Vec<i32>, AdmissionError> {
    let value = required(map, key, origin)?;
    let tokens = split_list(value);

    if !no_duplicates(&tokens) {
        return Err(AdmissionError::Duplicate {
            origin,
            key,
            values: tokens.iter().map(|t| t.to_string()).collect(),
            example: PORT_LIST_EXAMPLE,
        });
    }

    tokens
        .into_iter()
        .map(|token| {
            let format_error = || AdmissionError::Format {
                origin,
                key,
                token: token.to_string(),
                example: PORT_LIST_EXAMPLE,
            };
            if !is_valid_port(token) {
                return Err(format_error());
            }
            token.parse::<i32>().map_err(|_| format_error())
        })
        .collect()
}

/// Look up `key`, reporting absence as a denial
pub fn required<'a>(
    map: Option<&'a BTreeMap<String, String>>,
    key: &'static str,
    origin: Source,
) -> Result<&'a str, AdmissionError> {
    map.and_then(|m| m.get(key))
        .map(String::as_str)
        .ok_or(AdmissionError::Missing { origin, key })
}

/// Value of `key` in an optional string map
pub fn lookup<'a>(map: Option<&'a BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    map.and_then(|m| m.get(key)).map(String::as_str)
}
