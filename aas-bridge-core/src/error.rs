//! Error types for every stage of the bridge.
//!
//! Each concern gets its own enum so callers can match on what actually went wrong:
//! reference construction, tree walking, inventory persistence, synchronisation,
//! proxying and configuration. External collaborators report failures through the
//! boxed [`crate::contract::StoreError`] instead, mirroring how the collaborator
//! traits are implemented outside this crate.

use std::path::PathBuf;

use crate::contract::StoreError;
use crate::reference::{KeyKind, StableId};

/// A key sequence that does not describe a node of the element tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference has no keys")]
    Empty,

    #[error("reference must start at a shell or a submodel, found {kind}")]
    InvalidRoot { kind: KeyKind },

    #[error("{kind} may not appear at position {position}")]
    MisplacedIdentifiable { kind: KeyKind, position: usize },

    #[error("element key at position {position} has no submodel above it")]
    MissingParentPath { position: usize },

    #[error("key at position {position} has an empty value")]
    EmptyKeyValue { position: usize },

    #[error("list child at position {position} has non-numeric index {value:?}")]
    InvalidListIndex { position: usize, value: String },

    #[error("unknown key kind {0:?}")]
    UnknownKind(String),

    #[error("malformed stable id {0:?}")]
    InvalidStableId(String),
}

/// One failed check of the data-address validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid data address: {}", format_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a walk of the backing repository was abandoned. A walk never returns a partial tree.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed payload at {location}: {reason}")]
    Malformed { location: String, reason: String },

    #[error("element tree deeper than {max_depth} at {location}")]
    DepthExceeded { max_depth: usize, location: String },

    #[error("element {0} appears more than once")]
    DuplicateReference(String),

    #[error(transparent)]
    Reference(#[from] ReferenceError),
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("could not read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write inventory {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inventory {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode inventory: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of one synchronisation cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("walk failed: {0}")]
    Walk(#[from] WalkError),

    #[error("stable id {id} derived from both {first} and {second}")]
    IdCollision {
        id: StableId,
        first: String,
        second: String,
    },

    #[error("catalog {operation} failed for {target}: {source}")]
    Store {
        operation: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    #[error("catalog batch failed and could not be rolled back: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("cycle cancelled")]
    Cancelled,
}

impl SyncError {
    /// Fatal errors abort the cycle loudly instead of waiting for the next interval.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::IdCollision { .. } | SyncError::Unrecoverable(_) | SyncError::Inventory(_)
        )
    }
}

/// Outcome of a failed proxy transfer, as reported to the transfer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no cataloged resource with id {0}")]
    UnknownResource(StableId),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("{url} not found")]
    NotFound { url: String },

    #[error("{url} unavailable after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("stream from {url} broke after {bytes} bytes: {reason}")]
    Interrupted {
        url: String,
        bytes: u64,
        reason: String,
    },

    #[error("{url} rejected the request with status {status}")]
    Permanent { url: String, status: u16 },

    #[error("payload exceeds {limit} bytes (at least {received} received or announced)")]
    SizeLimit { limit: u64, received: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("writing to sink failed: {0}")]
    Sink(#[from] std::io::Error),

    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("proxy is shutting down")]
    Closed,
}

impl ProxyError {
    /// Whether the transfer pipeline may retry the whole transfer later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Transient { .. } | ProxyError::Interrupted { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no environments configured")]
    NoEnvironments,

    #[error("environment {0:?} configured more than once")]
    DuplicateEnvironment(String),

    #[error("environment {environment:?} has invalid base url {url:?}: {reason}")]
    InvalidBaseUrl {
        environment: String,
        url: String,
        reason: String,
    },

    #[error("{field} must be at least {min}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("environment {environment:?} has an invalid header: {reason}")]
    InvalidHeader { environment: String, reason: String },

    #[error("policy rule pattern {pattern:?} does not compile: {source}")]
    InvalidRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised while assembling or driving the per-environment runtime.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("unknown environment {0:?}")]
    UnknownEnvironment(String),
}
