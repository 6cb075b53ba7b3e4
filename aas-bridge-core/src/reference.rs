//! Reference model: addressing nodes of the element tree and deriving their stable ids.
//!
//! A [`Reference`] is the ordered key path from a shell (or a submodel that no shell
//! points to) down to one element. It is the only input to [`StableId::derive`], so two
//! runs over an unchanged repository always produce the same catalog identifiers.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ReferenceError;
use crate::model::ContentKind;

/// Kind of a reference key. Names follow the AAS v3 metamodel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyKind {
    AssetAdministrationShell,
    Submodel,
    SubmodelElementCollection,
    SubmodelElementList,
    Property,
    MultiLanguageProperty,
    Range,
    File,
    Blob,
    ReferenceElement,
    RelationshipElement,
    AnnotatedRelationshipElement,
    Entity,
    Operation,
    Capability,
    BasicEventElement,
}

impl KeyKind {
    const ALL: [KeyKind; 16] = [
        KeyKind::AssetAdministrationShell,
        KeyKind::Submodel,
        KeyKind::SubmodelElementCollection,
        KeyKind::SubmodelElementList,
        KeyKind::Property,
        KeyKind::MultiLanguageProperty,
        KeyKind::Range,
        KeyKind::File,
        KeyKind::Blob,
        KeyKind::ReferenceElement,
        KeyKind::RelationshipElement,
        KeyKind::AnnotatedRelationshipElement,
        KeyKind::Entity,
        KeyKind::Operation,
        KeyKind::Capability,
        KeyKind::BasicEventElement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::AssetAdministrationShell => "AssetAdministrationShell",
            KeyKind::Submodel => "Submodel",
            KeyKind::SubmodelElementCollection => "SubmodelElementCollection",
            KeyKind::SubmodelElementList => "SubmodelElementList",
            KeyKind::Property => "Property",
            KeyKind::MultiLanguageProperty => "MultiLanguageProperty",
            KeyKind::Range => "Range",
            KeyKind::File => "File",
            KeyKind::Blob => "Blob",
            KeyKind::ReferenceElement => "ReferenceElement",
            KeyKind::RelationshipElement => "RelationshipElement",
            KeyKind::AnnotatedRelationshipElement => "AnnotatedRelationshipElement",
            KeyKind::Entity => "Entity",
            KeyKind::Operation => "Operation",
            KeyKind::Capability => "Capability",
            KeyKind::BasicEventElement => "BasicEventElement",
        }
    }

    /// Shells and submodels carry globally unique ids instead of idShorts.
    pub fn is_identifiable(&self) -> bool {
        matches!(self, KeyKind::AssetAdministrationShell | KeyKind::Submodel)
    }

    /// Where element children live in the JSON payload, if this kind has any.
    pub fn children_field(&self) -> Option<&'static str> {
        match self {
            KeyKind::SubmodelElementCollection | KeyKind::SubmodelElementList => Some("value"),
            KeyKind::Entity => Some("statements"),
            KeyKind::AnnotatedRelationshipElement => Some("annotations"),
            _ => None,
        }
    }

    /// How the proxy fetches content for this kind by default.
    pub fn default_content_kind(&self) -> ContentKind {
        match self {
            KeyKind::Property | KeyKind::MultiLanguageProperty | KeyKind::Range => {
                ContentKind::Value
            }
            KeyKind::File | KeyKind::Blob => ContentKind::Attachment,
            _ => ContentKind::Element,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ReferenceError::UnknownKind(s.to_string()))
    }
}

/// One step of a reference: the kind of node and its id (identifiables) or idShort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "type")]
    pub kind: KeyKind,
    pub value: String,
}

impl Key {
    pub fn new(kind: KeyKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Well-formed, non-empty key path into the element tree. Key order is significant for
/// equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<Key>", into = "Vec<Key>")]
pub struct Reference {
    keys: Vec<Key>,
}

impl Reference {
    pub fn new(keys: Vec<Key>) -> Result<Self, ReferenceError> {
        let Some(root) = keys.first() else {
            return Err(ReferenceError::Empty);
        };
        if !root.kind.is_identifiable() {
            return Err(ReferenceError::InvalidRoot { kind: root.kind });
        }
        for (position, key) in keys.iter().enumerate() {
            if key.value.is_empty() {
                return Err(ReferenceError::EmptyKeyValue { position });
            }
            if position == 0 {
                continue;
            }
            let previous = keys[position - 1].kind;
            match key.kind {
                KeyKind::AssetAdministrationShell => {
                    return Err(ReferenceError::MisplacedIdentifiable {
                        kind: key.kind,
                        position,
                    })
                }
                KeyKind::Submodel if previous != KeyKind::AssetAdministrationShell => {
                    return Err(ReferenceError::MisplacedIdentifiable {
                        kind: key.kind,
                        position,
                    })
                }
                KeyKind::Submodel => {}
                _ if previous == KeyKind::AssetAdministrationShell => {
                    return Err(ReferenceError::MissingParentPath { position })
                }
                _ if previous == KeyKind::SubmodelElementList
                    && key.value.parse::<usize>().is_err() =>
                {
                    return Err(ReferenceError::InvalidListIndex {
                        position,
                        value: key.value.clone(),
                    })
                }
                _ => {}
            }
        }
        Ok(Self { keys })
    }

    pub fn shell(id: impl Into<String>) -> Self {
        Self {
            keys: vec![Key::new(KeyKind::AssetAdministrationShell, id)],
        }
    }

    pub fn submodel(id: impl Into<String>) -> Self {
        Self {
            keys: vec![Key::new(KeyKind::Submodel, id)],
        }
    }

    /// Extends this reference by one key, re-checking well-formedness.
    pub fn child(&self, kind: KeyKind, value: impl Into<String>) -> Result<Self, ReferenceError> {
        let mut keys = self.keys.clone();
        keys.push(Key::new(kind, value));
        Self::new(keys)
    }

    /// The reference one level up, or `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        if self.keys.len() < 2 {
            return None;
        }
        Some(Self {
            keys: self.keys[..self.keys.len() - 1].to_vec(),
        })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn root(&self) -> &Key {
        &self.keys[0]
    }

    pub fn last(&self) -> &Key {
        &self.keys[self.keys.len() - 1]
    }

    pub fn kind(&self) -> KeyKind {
        self.last().kind
    }

    pub fn depth(&self) -> usize {
        self.keys.len()
    }

    /// Dotted idShort path of the element part, with list children as `[i]`.
    pub fn id_short_path(&self) -> Option<String> {
        let first_element = self.keys.iter().position(|k| !k.kind.is_identifiable())?;
        let mut path = String::new();
        for (position, key) in self.keys.iter().enumerate().skip(first_element) {
            if self.keys[position - 1].kind == KeyKind::SubmodelElementList {
                path.push('[');
                path.push_str(&key.value);
                path.push(']');
            } else {
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(&key.value);
            }
        }
        Some(path)
    }

    /// Repository-relative HTTP path of this node (no leading slash).
    pub fn encoded_path(&self) -> String {
        let mut segments = Vec::new();
        for key in self.keys.iter().take_while(|k| k.kind.is_identifiable()) {
            let collection = match key.kind {
                KeyKind::AssetAdministrationShell => "shells",
                _ => "submodels",
            };
            segments.push(format!("{collection}/{}", encode_identifier(&key.value)));
        }
        let mut path = segments.join("/");
        if let Some(elements) = self.id_short_path() {
            path.push_str("/submodel-elements/");
            path.push_str(&elements);
        }
        path
    }
}

impl TryFrom<Vec<Key>> for Reference {
    type Error = ReferenceError;

    fn try_from(keys: Vec<Key>) -> Result<Self, Self::Error> {
        Self::new(keys)
    }
}

impl From<Reference> for Vec<Key> {
    fn from(reference: Reference) -> Self {
        reference.keys
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .keys
            .iter()
            .map(|k| format!("{}:{}", k.kind, k.value))
            .collect::<Vec<_>>()
            .join(" / ");
        f.write_str(&rendered)
    }
}

/// Encodes a shell or submodel id as a path segment (base64url, unpadded).
pub fn encode_identifier(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

/// Deterministic catalog identifier of a reference within one environment namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StableId(String);

impl StableId {
    /// SHA-256 over the namespace, the encoded path and the key kinds, hex encoded.
    pub fn derive(namespace: &str, reference: &Reference) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b"\n");
        hasher.update(reference.encoded_path().as_bytes());
        for key in reference.keys() {
            hasher.update(b"\n");
            hasher.update(key.kind.as_str().as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StableId {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_string()))
        } else {
            Err(ReferenceError::InvalidStableId(s.to_string()))
        }
    }
}

impl TryFrom<String> for StableId {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StableId> for String {
    fn from(id: StableId) -> Self {
        id.0
    }
}
