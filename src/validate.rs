//! Format validators for label-encoded parameters
//!
//! IPs and ports arrive as hyphen-joined label values
//! (`externalIP=10.0.0.1-10.0.0.2`, `externalPort=80-443`). Each token is
//! checked against a fixed grammar rather than a general parser, so inputs
//! like `" 8.8.8.8"` or `"080"` that a lenient parser would accept are
//! rejected.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::LazyLock;

use regex::Regex;

/// Separator used for list-valued labels
pub const LIST_SEPARATOR: char = '-';

/// A single octet: 0-255, no leading zeros. "0" is valid in every position.
const OCTET: &str = r"(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9][0-9]|[0-9])";

/// 1-65535, no leading zeros or sign
const PORT: &str =
    r"(?:6553[0-5]|655[0-2][0-9]|65[0-4][0-9]{2}|6[0-4][0-9]{3}|[1-5][0-9]{4}|[1-9][0-9]{0,3})";

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{OCTET}\.{OCTET}\.{OCTET}\.{OCTET}$"))
        .expect("hardcoded IPv4 grammar is valid")
});

static PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{PORT}$")).expect("hardcoded port grammar is valid")
});

/// True if `s` is a dotted-quad IPv4 literal
pub fn is_valid_ipv4(s: &str) -> bool {
    IPV4_RE.is_match(s)
}

/// True if `s` is a decimal port in 1..=65535
pub fn is_valid_port(s: &str) -> bool {
    PORT_RE.is_match(s)
}

/// True iff every element is pairwise distinct. Empty input is distinct.
pub fn no_duplicates<T: Eq + Hash>(items: &[T]) -> bool {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().all(|item| seen.insert(item))
}

/// Split a hyphen-joined label value into its tokens
pub fn split_list(value: &str) -> Vec<&str> {
    value.split(LIST_SEPARATOR).collect()
}
