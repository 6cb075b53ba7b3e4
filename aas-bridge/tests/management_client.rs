use std::collections::BTreeMap;

use aas_bridge::load_config::ManagementSection;
use aas_bridge::management::{asset_body, contract_definition_body, ManagementClient};
use aas_bridge_core::contract::{CatalogResource, CatalogStore, PolicyBinding};
use aas_bridge_core::model::{ContentKind, DataAddress};
use aas_bridge_core::reference::{KeyKind, Reference, StableId};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NS: &str = "http://repository.test/api/v3.0";

fn resource() -> CatalogResource {
    let reference = Reference::submodel("M1").child(KeyKind::Property, "P1").unwrap();
    let mut headers = BTreeMap::new();
    headers.insert("x-api-key".to_string(), "repo-key".to_string());
    CatalogResource {
        id: StableId::derive(NS, &reference),
        name: "P1".to_string(),
        kind: KeyKind::Property,
        semantic_id: Some("urn:test:temperature".to_string()),
        content_type: None,
        parent_id: Some(StableId::derive(NS, &Reference::submodel("M1"))),
        data_address: DataAddress::new(NS, reference.clone(), ContentKind::Value, headers).unwrap(),
        reference,
    }
}

fn binding() -> PolicyBinding {
    PolicyBinding {
        id: "binding-0123".to_string(),
        access_policy_id: "allow-members".to_string(),
        contract_policy_id: "use-eu".to_string(),
        resource_ids: vec![resource().id],
    }
}

fn client(server: &MockServer) -> ManagementClient {
    ManagementClient::new(&ManagementSection {
        url: format!("{}/management", server.uri()),
        api_key: Some("secret".to_string()),
        request_timeout_secs: 5,
    })
    .unwrap()
}

#[test]
fn test_asset_body_carries_data_address_and_headers() {
    let resource = resource();
    let body = asset_body(&resource);
    assert_eq!(body["@id"], json!(resource.id.as_str()));
    assert_eq!(body["properties"]["name"], json!("P1"));
    assert_eq!(body["properties"]["aas:semanticId"], json!("urn:test:temperature"));
    assert_eq!(
        body["dataAddress"]["baseUrl"],
        json!(format!("{NS}/submodels/TTE/submodel-elements/P1/$value"))
    );
    assert_eq!(body["dataAddress"]["header:x-api-key"], json!("repo-key"));
    assert_eq!(body["dataAddress"]["aas:contentKind"], json!("value"));
}

#[test]
fn test_contract_definition_selects_bound_resources() {
    let body = contract_definition_body(&binding());
    assert_eq!(body["accessPolicyId"], json!("allow-members"));
    assert_eq!(body["assetsSelector"][0]["operator"], json!("in"));
    assert_eq!(
        body["assetsSelector"][0]["operandRight"],
        json!([resource().id.as_str()])
    );
}

#[tokio::test]
async fn test_create_posts_asset_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v3/assets"))
        .and(header("x-api-key", "secret"))
        .and(body_partial_json(json!({"properties": {"name": "P1"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).create_resource(&resource()).await.unwrap();
}

#[tokio::test]
async fn test_create_conflict_falls_back_to_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v3/assets"))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/management/v3/assets"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).create_resource(&resource()).await.unwrap();
}

#[tokio::test]
async fn test_update_of_missing_asset_fails() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/management/v3/assets"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).update_resource(&resource()).await.is_err());
}

#[tokio::test]
async fn test_delete_of_missing_asset_counts_as_done() {
    let server = MockServer::start().await;
    let id = resource().id;
    Mock::given(method("DELETE"))
        .and(path(format!("/management/v3/assets/{id}")))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).delete_resource(&id).await.unwrap();
}

#[tokio::test]
async fn test_binding_upsert_and_delete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v3/contractdefinitions"))
        .and(body_partial_json(json!({"@id": "binding-0123", "contractPolicyId": "use-eu"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/management/v3/contractdefinitions/binding-0123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.upsert_binding(&binding()).await.unwrap();
    client.delete_binding("binding-0123").await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database offline"))
        .mount(&server)
        .await;

    let err = client(&server).upsert_binding(&binding()).await.unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");
    assert!(err.to_string().contains("database offline"), "{err}");
}
