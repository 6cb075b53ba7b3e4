//! Validation gate for data addresses.
//!
//! Runs before an address is attached to an inventory entry and again whenever one is
//! read back from disk, so the proxy never sees an address it cannot turn into a request.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{ValidationError, Violation};
use crate::model::{ContentKind, DataAddress};
use crate::reference::KeyKind;

fn id_short_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap_or_else(|e| panic!("idShort pattern: {e}"))
    })
}

/// Collects every violation instead of stopping at the first one.
pub fn validate_data_address(address: &DataAddress) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    check_base_url(address.base_url(), &mut violations);

    let keys = address.reference().keys();
    for (position, key) in keys.iter().enumerate() {
        if key.kind.is_identifiable() {
            continue;
        }
        let under_list = position > 0 && keys[position - 1].kind == KeyKind::SubmodelElementList;
        if !under_list && !id_short_pattern().is_match(&key.value) {
            violations.push(Violation::new(
                "reference",
                format!("idShort {:?} at position {position} is not a valid idShort", key.value),
            ));
        }
    }

    let kind = address.reference().kind();
    let compatible = match address.content_kind() {
        ContentKind::Element => true,
        ContentKind::Value => matches!(
            kind,
            KeyKind::Property | KeyKind::MultiLanguageProperty | KeyKind::Range
        ),
        ContentKind::Attachment => matches!(kind, KeyKind::File | KeyKind::Blob),
    };
    if !compatible {
        violations.push(Violation::new(
            "content_kind",
            format!("{} content is not available for {kind}", address.content_kind()),
        ));
    }

    check_headers(address.headers(), &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

pub(crate) fn check_base_url(base_url: &str, violations: &mut Vec<Violation>) {
    match Url::parse(base_url) {
        Ok(url) if !matches!(url.scheme(), "http" | "https") => violations.push(Violation::new(
            "base_url",
            format!("unsupported scheme {:?}", url.scheme()),
        )),
        Ok(url) if url.host_str().map_or(true, str::is_empty) => {
            violations.push(Violation::new("base_url", "url has no host"))
        }
        Ok(url) if url.query().is_some() || url.fragment().is_some() => violations.push(
            Violation::new("base_url", "url may not carry a query or fragment"),
        ),
        Ok(_) => {}
        Err(e) => violations.push(Violation::new(
            "base_url",
            format!("{base_url:?} is not an absolute url: {e}"),
        )),
    }
}

pub(crate) fn check_headers(headers: &BTreeMap<String, String>, violations: &mut Vec<Violation>) {
    for (name, value) in headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            violations.push(Violation::new("headers", format!("invalid header name {name:?}")));
        }
        if HeaderValue::from_str(value).is_err() {
            violations.push(Violation::new(
                "headers",
                format!("invalid value for header {name:?}"),
            ));
        }
    }
}

/// Converts configured static headers into a request header map.
pub fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, Violation> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Violation::new("headers", format!("invalid header name {name:?}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| Violation::new("headers", format!("invalid value for header {name:?}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}
