use aas_bridge_core::reference::{KeyKind, Reference, StableId};
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use std::fs::write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A repository without a shell interface holding submodel M1 with one property P1 = 42.
async fn repository() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shells"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/submodels/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"id": "M1"}],
            "paging_metadata": {}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/submodels/TTE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "M1",
            "idShort": "Nameplate",
            "modelType": "Submodel",
            "submodelElements": [
                {"modelType": "Property", "idShort": "P1", "valueType": "xs:int", "value": "42"}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/submodels/TTE/submodel-elements/P1/$value"))
        .respond_with(ResponseTemplate::new(200).set_body_string("42"))
        .mount(&server)
        .await;
    server
}

async fn management() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path_regex("^/management/v3/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn config_file(repository: &str, management: Option<&str>, inventory: Option<&Path>) -> NamedTempFile {
    let mut yaml = String::new();
    if let Some(url) = management {
        yaml.push_str(&format!("management:\n  url: {url}/management\n"));
    }
    yaml.push_str(&format!(
        "environments:\n  - name: factory\n    base_url: {repository}\n"
    ));
    if let Some(inventory) = inventory {
        yaml.push_str(&format!("    inventory_path: {}\n", inventory.display()));
    }
    let file = NamedTempFile::new().expect("Creating temp config file failed");
    write(file.path(), yaml).expect("Writing temp config failed");
    file
}

fn bridge() -> Command {
    let mut cmd = Command::cargo_bin("aas-bridge").expect("Binary exists");
    cmd.env_remove("AAS_BRIDGE_MANAGEMENT_API_KEY");
    cmd
}

#[test]
fn help_lists_every_command() {
    bridge()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("sync")
                .and(predicate::str::contains("run"))
                .and(predicate::str::contains("fetch")),
        );
}

#[test]
fn sync_with_missing_config_fails() {
    bridge()
        .args(["sync", "--config", "/definitely/not/here.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_without_management_requires_dry_run() {
    let repository = repository().await;
    let config = config_file(&repository.uri(), None, None);

    bridge()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("management"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_dry_run_prints_report_without_touching_inventory() {
    let repository = repository().await;
    let state = TempDir::new().unwrap();
    let inventory = state.path().join("factory.json");
    let config = config_file(&repository.uri(), None, Some(&inventory));

    bridge()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Synchronised factory: Completed")
                .and(predicate::str::contains("created=2")),
        );
    assert!(!inventory.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_unknown_environment_fails() {
    let repository = repository().await;
    let config = config_file(&repository.uri(), None, None);

    bridge()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .args(["--dry-run", "--environment", "warehouse"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("warehouse"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_then_fetch_streams_element_value() {
    let repository = repository().await;
    let management = management().await;
    let state = TempDir::new().unwrap();
    let inventory = state.path().join("factory.json");
    let config = config_file(&repository.uri(), Some(&management.uri()), Some(&inventory));

    bridge()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("created=2"));
    assert!(inventory.exists());

    let p1 = Reference::submodel("M1").child(KeyKind::Property, "P1").unwrap();
    let id = StableId::derive(&repository.uri(), &p1);
    let output = state.path().join("p1.value");

    bridge()
        .arg("fetch")
        .arg("--config")
        .arg(config.path())
        .args(["--environment", "factory", "--resource", id.as_str()])
        .arg("--output")
        .arg(&output)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "42");

    bridge()
        .arg("fetch")
        .arg("--config")
        .arg(config.path())
        .args(["--environment", "factory", "--resource", &"0".repeat(64)])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no cataloged resource"));
}
