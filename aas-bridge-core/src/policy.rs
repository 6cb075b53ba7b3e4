//! Policy selection: which (access, contract) pairs a resource is offered under.

use std::collections::BTreeSet;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::PolicyConfig;
use crate::error::ConfigError;
use crate::model::{ElementMetadata, PolicyPair};
use crate::reference::{KeyKind, Reference};

#[derive(Debug, Clone)]
struct CompiledRule {
    semantic_id: Option<Regex>,
    path: Option<Regex>,
    kinds: Vec<KeyKind>,
    pair: PolicyPair,
}

impl CompiledRule {
    fn matches(&self, reference: &Reference, metadata: &ElementMetadata) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&reference.kind()) {
            return false;
        }
        if let Some(pattern) = &self.semantic_id {
            match &metadata.semantic_id {
                Some(semantic_id) if pattern.is_match(semantic_id) => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.path {
            if !pattern.is_match(&reference.to_string()) {
                return false;
            }
        }
        true
    }
}

/// Compiled form of a [`PolicyConfig`].
#[derive(Debug, Clone, Default)]
pub struct PolicyRules {
    rules: Vec<CompiledRule>,
    default: Option<PolicyPair>,
}

fn compile_pattern(pattern: &Option<String>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::InvalidRule {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()
}

impl PolicyRules {
    pub fn compile(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    semantic_id: compile_pattern(&rule.semantic_id)?,
                    path: compile_pattern(&rule.path)?,
                    kinds: rule.kinds.clone(),
                    pair: PolicyPair::new(&rule.access_policy_id, &rule.contract_policy_id),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            rules,
            default: config.default.clone(),
        })
    }

    /// Every matching rule binds. Without a match the parent's pairs are inherited, and
    /// a root without a match falls back to the default pair. Result is sorted.
    pub fn select(
        &self,
        reference: &Reference,
        metadata: &ElementMetadata,
        inherited: Option<&[PolicyPair]>,
    ) -> Vec<PolicyPair> {
        let matched: BTreeSet<PolicyPair> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(reference, metadata))
            .map(|rule| rule.pair.clone())
            .collect();
        if !matched.is_empty() {
            return matched.into_iter().collect();
        }
        match inherited {
            Some(pairs) if !pairs.is_empty() => {
                let unique: BTreeSet<PolicyPair> = pairs.iter().cloned().collect();
                unique.into_iter().collect()
            }
            _ => self.default.iter().cloned().collect(),
        }
    }
}

/// Identifier of the binding that groups every resource offered under `pair`.
pub fn binding_id(namespace: &str, pair: &PolicyPair) -> String {
    let mut hasher = Sha256::new();
    for part in [namespace, &pair.access_policy_id, &pair.contract_policy_id] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("binding-{}", &digest[..32])
}
