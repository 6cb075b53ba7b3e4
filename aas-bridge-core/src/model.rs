//! Plain data shared by the walker, the inventory, the synchroniser and the proxy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ValidationError, Violation};
use crate::reference::{Key, KeyKind, Reference, StableId};
use crate::validate::{check_base_url, check_headers, validate_data_address};

/// How the proxy asks the repository for an element's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// The whole element serialised as JSON.
    Element,
    /// The raw value (`$value`) of a data element.
    Value,
    /// The attached file or blob content.
    Attachment,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Element => "element",
            ContentKind::Value => "value",
            ContentKind::Attachment => "attachment",
        }
    }

    /// Path suffix appended to the element path.
    pub fn path_suffix(&self) -> &'static str {
        match self {
            ContentKind::Element => "",
            ContentKind::Value => "/$value",
            ContentKind::Attachment => "/attachment",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = Violation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "element" => Ok(ContentKind::Element),
            "value" => Ok(ContentKind::Value),
            "attachment" => Ok(ContentKind::Attachment),
            other => Err(Violation::new(
                "content_kind",
                format!("unrecognized content kind {other:?}"),
            )),
        }
    }
}

/// Mutable descriptive metadata of one node. Its hash is the node's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMetadata {
    pub kind: KeyKind,
    pub id_short: Option<String>,
    pub semantic_id: Option<String>,
    pub value_type: Option<String>,
    pub display_name: Option<String>,
    pub content_type: Option<String>,
}

impl ElementMetadata {
    pub fn new(kind: KeyKind) -> Self {
        Self {
            kind,
            id_short: None,
            semantic_id: None,
            value_type: None,
            display_name: None,
            content_type: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for field in [
            Some(self.kind.as_str()),
            self.id_short.as_deref(),
            self.semantic_id.as_deref(),
            self.value_type.as_deref(),
            self.display_name.as_deref(),
            self.content_type.as_deref(),
        ] {
            // Length-prefix every field so adjacent values cannot run together.
            match field {
                Some(value) => {
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(u64::MAX.to_be_bytes()),
            }
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the proxy needs to rebuild the backend request for one element.
/// Only constructible through validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDataAddress")]
pub struct DataAddress {
    base_url: String,
    reference: Reference,
    content_kind: ContentKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawDataAddress {
    base_url: String,
    reference: Vec<Key>,
    content_kind: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl TryFrom<RawDataAddress> for DataAddress {
    type Error = ValidationError;

    fn try_from(raw: RawDataAddress) -> Result<Self, Self::Error> {
        DataAddress::from_parts(&raw.base_url, raw.reference, &raw.content_kind, raw.headers)
    }
}

impl DataAddress {
    pub fn new(
        base_url: impl Into<String>,
        reference: Reference,
        content_kind: ContentKind,
        headers: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let address = Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reference,
            content_kind,
            headers,
        };
        validate_data_address(&address)?;
        Ok(address)
    }

    /// Builds an address from untyped parts, reporting every problem at once.
    pub fn from_parts(
        base_url: &str,
        keys: Vec<Key>,
        content_kind: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let mut violations = Vec::new();
        let reference = Reference::new(keys)
            .map_err(|e| violations.push(Violation::new("reference", e.to_string())))
            .ok();
        let content_kind = content_kind
            .parse::<ContentKind>()
            .map_err(|v| violations.push(v))
            .ok();
        match (reference, content_kind) {
            (Some(reference), Some(content_kind)) if violations.is_empty() => {
                Self::new(base_url, reference, content_kind, headers)
            }
            _ => {
                check_base_url(base_url.trim_end_matches('/'), &mut violations);
                check_headers(&headers, &mut violations);
                Err(ValidationError { violations })
            }
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// `baseUrl + encode(reference)` plus the content-kind suffix.
    pub fn request_url(&self) -> String {
        format!(
            "{}/{}{}",
            self.base_url,
            self.reference.encoded_path(),
            self.content_kind.path_suffix()
        )
    }
}

/// One node observed in the backing repository during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveElement {
    pub reference: Reference,
    pub metadata: ElementMetadata,
    pub content_kind: ContentKind,
}

impl LiveElement {
    pub fn new(reference: Reference, metadata: ElementMetadata) -> Self {
        let content_kind = reference.kind().default_content_kind();
        Self {
            reference,
            metadata,
            content_kind,
        }
    }
}

/// The complete set of nodes observed by one successful walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTree {
    pub elements: Vec<LiveElement>,
}

impl LiveTree {
    pub fn new(elements: Vec<LiveElement>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// An (access policy, contract policy) pair a resource is offered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyPair {
    pub access_policy_id: String,
    pub contract_policy_id: String,
}

impl PolicyPair {
    pub fn new(access_policy_id: impl Into<String>, contract_policy_id: impl Into<String>) -> Self {
        Self {
            access_policy_id: access_policy_id.into(),
            contract_policy_id: contract_policy_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryState {
    Active,
    Stale,
}

/// A previously synchronised node, as remembered between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub id: StableId,
    pub reference: Reference,
    pub parent_id: Option<StableId>,
    pub fingerprint: Fingerprint,
    pub metadata: ElementMetadata,
    pub data_address: DataAddress,
    pub state: EntryState,
    /// Consecutive successful cycles this entry was absent from.
    #[serde(default)]
    pub missed_cycles: u32,
    #[serde(default)]
    pub policies: Vec<PolicyPair>,
}
