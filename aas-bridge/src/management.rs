//! # Management API adapter
//!
//! Implements [`CatalogStore`] against a dataspace connector's management API (v3): catalog
//! resources become assets, policy bindings become contract definitions whose asset
//! selector lists the bound resource ids.
//!
//! - `POST /v3/assets`, `PUT /v3/assets`, `DELETE /v3/assets/{id}`
//! - `POST /v3/contractdefinitions`, `PUT /v3/contractdefinitions`,
//!   `DELETE /v3/contractdefinitions/{id}`
//!
//! A create answered with 409 falls back to an update, so a cycle that re-creates what an
//! earlier, interrupted cycle already created still converges. A delete answered with 404
//! counts as done.
//!
//! The API key is sent as `x-api-key` on every request.

use std::time::Duration;

use aas_bridge_core::contract::{CatalogResource, CatalogStore, PolicyBinding, StoreError};
use aas_bridge_core::reference::StableId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};

use crate::load_config::ManagementSection;

const EDC_NAMESPACE: &str = "https://w3id.org/edc/v0.0.1/ns/";
const ASSETS: &str = "v3/assets";
const CONTRACT_DEFINITIONS: &str = "v3/contractdefinitions";

pub struct ManagementClient {
    client: reqwest::Client,
    base_url: String,
}

impl ManagementClient {
    pub fn new(section: &ManagementSection) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &section.api_key {
            let mut value =
                HeaderValue::from_str(api_key).context("management api key is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert("x-api-key", value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(section.request_timeout_secs))
            .build()
            .context("building management API client")?;
        tracing::info!(
            url = %section.url,
            api_key_set = section.api_key.is_some(),
            "Initialized management API client"
        );
        Ok(Self {
            client,
            base_url: section.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<StatusCode, StoreError> {
        let url = self.url(path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            tracing::error!(%method, url = %url, error = %e, "[CATALOG] request failed");
            e
        })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        let detail = response.text().await.unwrap_or_default();
        tracing::error!(%method, url = %url, status = status.as_u16(), detail = %detail, "[CATALOG] request rejected");
        Err(format!("{method} {url} answered with status {}: {detail}", status.as_u16()).into())
    }

    /// POST, and PUT the same body if the id is already taken.
    async fn create_or_update(&self, path: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        match self.send(Method::POST, path, Some(body)).await? {
            StatusCode::CONFLICT => {
                tracing::warn!(id = %id, path, "[CATALOG] already exists, updating instead");
                self.update(path, id, body).await
            }
            StatusCode::NOT_FOUND => Err(format!("{} not found", self.url(path)).into()),
            _ => Ok(()),
        }
    }

    async fn update(&self, path: &str, id: &str, body: &Value) -> Result<(), StoreError> {
        match self.send(Method::PUT, path, Some(body)).await? {
            StatusCode::NOT_FOUND => Err(format!("{id} does not exist").into()),
            StatusCode::CONFLICT => Err(format!("{id} could not be updated: conflict").into()),
            _ => Ok(()),
        }
    }

    async fn delete(&self, path: &str, id: &str) -> Result<(), StoreError> {
        let status = self
            .send(Method::DELETE, &format!("{path}/{id}"), None)
            .await?;
        match status {
            StatusCode::NOT_FOUND => {
                tracing::warn!(id = %id, path, "[CATALOG] already gone");
                Ok(())
            }
            StatusCode::CONFLICT => Err(format!("{id} is still referenced and cannot be deleted").into()),
            _ => Ok(()),
        }
    }
}

/// JSON-LD asset for one catalog resource. Repository headers travel as `header:` entries
/// of the HTTP data address.
pub fn asset_body(resource: &CatalogResource) -> Value {
    let address = &resource.data_address;
    let mut properties = Map::new();
    properties.insert("name".into(), json!(resource.name));
    properties.insert("aas:kind".into(), json!(resource.kind));
    properties.insert("aas:reference".into(), json!(resource.reference));
    if let Some(semantic_id) = &resource.semantic_id {
        properties.insert("aas:semanticId".into(), json!(semantic_id));
    }
    if let Some(content_type) = &resource.content_type {
        properties.insert("contenttype".into(), json!(content_type));
    }
    if let Some(parent_id) = &resource.parent_id {
        properties.insert("aas:parentId".into(), json!(parent_id));
    }

    let mut data_address = Map::new();
    data_address.insert("@type".into(), json!("DataAddress"));
    data_address.insert("type".into(), json!("HttpData"));
    data_address.insert("baseUrl".into(), json!(address.request_url()));
    data_address.insert("aas:contentKind".into(), json!(address.content_kind().as_str()));
    for (name, value) in address.headers() {
        data_address.insert(format!("header:{name}"), json!(value));
    }

    json!({
        "@context": { "@vocab": EDC_NAMESPACE },
        "@id": resource.id,
        "properties": properties,
        "dataAddress": data_address,
    })
}

/// JSON-LD contract definition selecting exactly the bound resources.
pub fn contract_definition_body(binding: &PolicyBinding) -> Value {
    json!({
        "@context": { "@vocab": EDC_NAMESPACE },
        "@id": binding.id,
        "accessPolicyId": binding.access_policy_id,
        "contractPolicyId": binding.contract_policy_id,
        "assetsSelector": [{
            "operandLeft": format!("{EDC_NAMESPACE}id"),
            "operator": "in",
            "operandRight": binding.resource_ids,
        }],
    })
}

#[async_trait]
impl CatalogStore for ManagementClient {
    async fn create_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        tracing::debug!(id = %resource.id, name = %resource.name, "[CATALOG] creating asset");
        self.create_or_update(ASSETS, resource.id.as_str(), &asset_body(resource))
            .await
    }

    async fn update_resource(&self, resource: &CatalogResource) -> Result<(), StoreError> {
        tracing::debug!(id = %resource.id, name = %resource.name, "[CATALOG] updating asset");
        self.update(ASSETS, resource.id.as_str(), &asset_body(resource))
            .await
    }

    async fn delete_resource(&self, id: &StableId) -> Result<(), StoreError> {
        tracing::debug!(id = %id, "[CATALOG] deleting asset");
        self.delete(ASSETS, id.as_str()).await
    }

    async fn upsert_binding(&self, binding: &PolicyBinding) -> Result<(), StoreError> {
        tracing::debug!(
            id = %binding.id,
            resources = binding.resource_ids.len(),
            "[CATALOG] upserting contract definition"
        );
        self.create_or_update(CONTRACT_DEFINITIONS, &binding.id, &contract_definition_body(binding))
            .await
    }

    async fn delete_binding(&self, binding_id: &str) -> Result<(), StoreError> {
        tracing::debug!(id = %binding_id, "[CATALOG] deleting contract definition");
        self.delete(CONTRACT_DEFINITIONS, binding_id).await
    }
}
