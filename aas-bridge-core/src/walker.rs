//! Tree walker: fetches the live element tree from an AAS repository (HTTP API v3).
//!
//! A walk lists shells and submodel metadata page by page, fetches every full submodel
//! with bounded concurrency and then flattens each submodel's element tree with an
//! explicit worklist. The result is all-or-nothing: any transport error, unexpected
//! status or malformed payload aborts the walk and nothing is returned.
//!
//! Shells are optional. A repository that answers the shell listing with 404, 405 or 501
//! has no shell interface; every submodel is then rooted directly.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{EnvironmentConfig, WalkConfig};
use crate::contract::TreeWalker;
use crate::error::WalkError;
use crate::model::{ElementMetadata, LiveElement, LiveTree};
use crate::reference::{encode_identifier, KeyKind, Reference};

/// Upper bound on pages per listing; a server that keeps handing out cursors fails the walk.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Deserialize)]
struct Page<T> {
    result: Vec<T>,
    #[serde(default)]
    paging_metadata: Option<PagingMetadata>,
}

#[derive(Debug, Deserialize)]
struct PagingMetadata {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LangString {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct KeyDto {
    #[serde(rename = "type", default)]
    kind: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ReferenceDto {
    #[serde(default)]
    keys: Vec<KeyDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellDto {
    id: String,
    #[serde(default)]
    id_short: Option<String>,
    #[serde(default)]
    display_name: Option<Vec<LangString>>,
    #[serde(default)]
    submodels: Option<Vec<ReferenceDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmodelDto {
    id: String,
    #[serde(default)]
    id_short: Option<String>,
    #[serde(default)]
    semantic_id: Option<ReferenceDto>,
    #[serde(default)]
    display_name: Option<Vec<LangString>>,
    #[serde(default)]
    submodel_elements: Option<Vec<Value>>,
}

fn first_text(names: &Option<Vec<LangString>>) -> Option<String> {
    names
        .as_ref()?
        .iter()
        .map(|n| n.text.trim())
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

fn semantic_value(reference: &Option<ReferenceDto>) -> Option<String> {
    reference
        .as_ref()?
        .keys
        .first()
        .map(|k| k.value.clone())
        .filter(|v| !v.is_empty())
}

/// Walks one repository over HTTP.
pub struct HttpTreeWalker {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    config: WalkConfig,
    environment: String,
}

impl HttpTreeWalker {
    pub fn new(env: &EnvironmentConfig) -> Result<Self, WalkError> {
        let headers =
            crate::validate::header_map(&env.headers).map_err(|v| WalkError::Malformed {
                location: "configured headers".to_string(),
                reason: v.message,
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(env.walk.request_timeout_secs))
            .build()
            .map_err(WalkError::Client)?;
        Ok(Self {
            client,
            base_url: env.namespace().to_string(),
            headers,
            config: env.walk.clone(),
            environment: env.name.clone(),
        })
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, WalkError> {
        self.client
            .get(url)
            .query(query)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|source| WalkError::Http {
                url: url.to_string(),
                source,
            })
    }

    async fn decode<T: DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, WalkError> {
        let bytes = response.bytes().await.map_err(|source| WalkError::Http {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| WalkError::Malformed {
            location: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Drains a cursor-paged listing. Returns `None` if `optional` and the first page
    /// answers with a status meaning "interface not provided".
    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        optional: bool,
    ) -> Result<Option<Vec<T>>, WalkError> {
        let url = format!("{}/{}", self.base_url, path);
        let limit = self.config.page_limit.to_string();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for page_number in 0..MAX_PAGES {
            let mut query = vec![("limit", limit.as_str())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.as_str()));
            }
            let response = self.get(&url, &query).await?;
            let status = response.status();
            if optional
                && page_number == 0
                && matches!(
                    status,
                    StatusCode::NOT_FOUND
                        | StatusCode::METHOD_NOT_ALLOWED
                        | StatusCode::NOT_IMPLEMENTED
                )
            {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(WalkError::Status {
                    url,
                    status: status.as_u16(),
                });
            }
            let page: Page<T> = Self::decode(&url, response).await?;
            debug!(
                url = %url,
                page = page_number,
                items = page.result.len(),
                "[WALK] fetched page"
            );
            items.extend(page.result);
            let next = page
                .paging_metadata
                .and_then(|m| m.cursor)
                .filter(|c| !c.is_empty());
            match next {
                None => return Ok(Some(items)),
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(WalkError::Malformed {
                        location: url,
                        reason: format!("paging cursor {next:?} did not advance"),
                    })
                }
                Some(next) => cursor = Some(next),
            }
        }
        Err(WalkError::Malformed {
            location: url,
            reason: format!("more than {MAX_PAGES} pages"),
        })
    }

    async fn fetch_submodel(&self, id: String) -> Result<SubmodelDto, WalkError> {
        let url = format!("{}/submodels/{}", self.base_url, encode_identifier(&id));
        let response = self.get(&url, &[]).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalkError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let submodel: SubmodelDto = Self::decode(&url, response).await?;
        if submodel.id != id {
            return Err(WalkError::Malformed {
                location: url,
                reason: format!("requested submodel {id:?} but received {:?}", submodel.id),
            });
        }
        Ok(submodel)
    }
}

#[async_trait]
impl TreeWalker for HttpTreeWalker {
    async fn walk(&self) -> Result<LiveTree, WalkError> {
        info!(environment = %self.environment, base_url = %self.base_url, "[WALK] starting walk");

        let shells = self.list_all::<ShellDto>("shells", true).await?;
        if shells.is_none() {
            info!(environment = %self.environment, "[WALK] repository has no shell interface");
        }
        let shells = shells.unwrap_or_default();

        let listed = self
            .list_all::<SubmodelDto>("submodels/$metadata", false)
            .await?
            .unwrap_or_default();
        let ids: BTreeSet<String> = listed.into_iter().map(|s| s.id).collect();

        let mut submodels: Vec<SubmodelDto> = stream::iter(ids.iter().cloned())
            .map(|id| self.fetch_submodel(id))
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await?;
        submodels.sort_by(|a, b| a.id.cmp(&b.id));

        let tree = assemble(&shells, &submodels, &ids, self.config.max_depth)?;
        info!(
            environment = %self.environment,
            shells = shells.len(),
            submodels = submodels.len(),
            elements = tree.len(),
            "[WALK] walk complete"
        );
        Ok(tree)
    }
}

/// Builds the flat, sorted node set from fetched shells and submodels.
fn assemble(
    shells: &[ShellDto],
    submodels: &[SubmodelDto],
    known_submodels: &BTreeSet<String>,
    max_depth: usize,
) -> Result<LiveTree, WalkError> {
    let mut elements = Vec::new();
    let mut seen: HashSet<Reference> = HashSet::new();
    let mut push = |element: LiveElement, elements: &mut Vec<LiveElement>| {
        if !seen.insert(element.reference.clone()) {
            return Err(WalkError::DuplicateReference(element.reference.to_string()));
        }
        elements.push(element);
        Ok(())
    };

    // submodel id -> shells referencing it
    let mut owners: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for shell in shells {
        let reference = Reference::shell(&shell.id);
        let mut metadata = ElementMetadata::new(KeyKind::AssetAdministrationShell);
        metadata.id_short = shell.id_short.clone();
        metadata.display_name = first_text(&shell.display_name);
        push(LiveElement::new(reference, metadata), &mut elements)?;

        for submodel_ref in shell.submodels.iter().flatten() {
            let Some(key) = submodel_ref.keys.iter().find(|k| k.kind == "Submodel") else {
                continue;
            };
            if known_submodels.contains(&key.value) {
                owners
                    .entry(key.value.as_str())
                    .or_default()
                    .insert(shell.id.as_str());
            } else {
                warn!(
                    shell = %shell.id,
                    submodel = %key.value,
                    "[WALK] shell references a submodel the repository does not list, ignoring"
                );
            }
        }
    }

    for submodel in submodels {
        let roots: Vec<Reference> = match owners.get(submodel.id.as_str()) {
            Some(shell_ids) => shell_ids
                .iter()
                .map(|shell_id| Reference::shell(*shell_id).child(KeyKind::Submodel, &submodel.id))
                .collect::<Result<_, _>>()?,
            None => vec![Reference::submodel(&submodel.id)],
        };
        for root in roots {
            let mut metadata = ElementMetadata::new(KeyKind::Submodel);
            metadata.id_short = submodel.id_short.clone();
            metadata.semantic_id = semantic_value(&submodel.semantic_id);
            metadata.display_name = first_text(&submodel.display_name);
            push(LiveElement::new(root.clone(), metadata), &mut elements)?;

            let children = submodel.submodel_elements.as_deref().unwrap_or_default();
            for element in flatten_elements(&root, children, max_depth)? {
                push(element, &mut elements)?;
            }
        }
    }

    elements.sort_by(|a, b| a.reference.cmp(&b.reference));
    Ok(LiveTree::new(elements))
}

/// Flattens a submodel's element tree iteratively, depth bounded by `max_depth` keys.
fn flatten_elements(
    root: &Reference,
    children: &[Value],
    max_depth: usize,
) -> Result<Vec<LiveElement>, WalkError> {
    let mut out = Vec::new();
    let mut worklist: Vec<(Reference, &Value, usize)> = children
        .iter()
        .enumerate()
        .rev()
        .map(|(i, v)| (root.clone(), v, i))
        .collect();

    while let Some((parent, value, index)) = worklist.pop() {
        let location = format!("{parent} [{index}]");
        if parent.depth() + 1 > max_depth {
            return Err(WalkError::DepthExceeded {
                max_depth,
                location,
            });
        }
        let malformed = |reason: String| WalkError::Malformed {
            location: location.clone(),
            reason,
        };
        let object = value
            .as_object()
            .ok_or_else(|| malformed("element is not a JSON object".to_string()))?;
        let model_type = object
            .get("modelType")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("element has no modelType".to_string()))?;
        let kind: KeyKind = model_type
            .parse()
            .map_err(|_| malformed(format!("unknown modelType {model_type:?}")))?;
        if kind.is_identifiable() {
            return Err(malformed(format!("{kind} cannot be a submodel element")));
        }

        let id_short = object
            .get("idShort")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let key_value = if parent.kind() == KeyKind::SubmodelElementList {
            index.to_string()
        } else {
            id_short
                .clone()
                .ok_or_else(|| malformed("element has no idShort".to_string()))?
        };
        let reference = parent.child(kind, key_value)?;

        let semantic_id = object
            .get("semanticId")
            .and_then(|s| s.get("keys"))
            .and_then(Value::as_array)
            .and_then(|keys| keys.first())
            .and_then(|k| k.get("value"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let display_name = object
            .get("displayName")
            .and_then(Value::as_array)
            .and_then(|names| {
                names
                    .iter()
                    .filter_map(|n| n.get("text").and_then(Value::as_str))
                    .find(|t| !t.trim().is_empty())
            })
            .map(|t| t.trim().to_string());
        let text_field = |field: &str| {
            object
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let metadata = ElementMetadata {
            kind,
            id_short,
            semantic_id,
            value_type: text_field("valueType"),
            display_name,
            content_type: text_field("contentType"),
        };

        if let Some(field) = kind.children_field() {
            match object.get(field) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for (i, child) in items.iter().enumerate().rev() {
                        worklist.push((reference.clone(), child, i));
                    }
                }
                Some(_) => {
                    return Err(malformed(format!("{field} of {kind} is not an array")));
                }
            }
        }

        out.push(LiveElement::new(reference, metadata));
    }
    Ok(out)
}
