//! HashiCorp Vault KV version 2 backend.
//!
//! `path` names the KV mount, `item` the secret below it and `field` the key
//! inside the secret's data.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use super::Vault;
use crate::errors::VaultError;
use crate::models::{VaultItem, VaultSpec};
use crate::remote::{Caller, RemoteError};

#[derive(Debug, Deserialize)]
struct KvRead {
    data: KvData,
}

#[derive(Debug, Deserialize)]
struct KvData {
    #[serde(default)]
    data: Option<Map<String, Value>>,
    metadata: KvVersion,
}

#[derive(Debug, Deserialize)]
struct KvVersion {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct KvMetadata {
    data: KvCurrent,
}

#[derive(Debug, Deserialize)]
struct KvCurrent {
    current_version: u64,
}

#[derive(Debug, Serialize)]
struct KvWrite<'a> {
    options: KvOptions,
    data: &'a Map<String, Value>,
}

/// Check-and-set: `0` only writes if the secret does not exist yet.
#[derive(Debug, Serialize)]
struct KvOptions {
    cas: u64,
}

fn missing_as_not_found(err: RemoteError) -> VaultError {
    match err {
        RemoteError::NotFound => VaultError::ItemNotFound,
        other => VaultError::Remote(other),
    }
}

pub struct HashiCorp {
    base: String,
    token: String,
    dry_run: bool,
    caller: Caller,
}

impl HashiCorp {
    pub fn new(base_url: &str, token: impl Into<String>, caller: Caller) -> Result<Self, VaultError> {
        let parsed = Url::parse(base_url).map_err(|e| {
            VaultError::InvalidItem(format!("invalid HashiCorp Vault URL '{}': {}", base_url, e))
        })?;
        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            token: token.into(),
            dry_run: false,
            caller,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn url(&self, kind: &str, spec: &VaultSpec) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.base,
            spec.path.trim_matches('/'),
            kind,
            spec.item.trim_matches('/')
        )
    }

    fn authed(&self, http: &Client, method: Method, url: &str) -> RequestBuilder {
        http.request(method, url).header("X-Vault-Token", &self.token)
    }

    /// Latest version of the secret, `None` when it has no metadata at all.
    ///
    /// Soft-deleted versions still count: their data reads as 404 but a
    /// write must check-and-set against them.
    async fn current_version(&self, spec: &VaultSpec) -> Result<Option<u64>, VaultError> {
        let url = self.url("metadata", spec);
        match self
            .caller
            .json::<KvMetadata, _>(|http| self.authed(http, Method::GET, &url))
            .await
        {
            Ok(meta) => Ok(Some(meta.data.current_version)),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(VaultError::Remote(e)),
        }
    }

    async fn read(&self, spec: &VaultSpec) -> Result<KvData, VaultError> {
        let url = self.url("data", spec);
        let read: KvRead = self
            .caller
            .json(|http| self.authed(http, Method::GET, &url))
            .await
            .map_err(missing_as_not_found)?;
        Ok(read.data)
    }

    async fn write(&self, spec: &VaultSpec, data: &Map<String, Value>, cas: u64) -> Result<u64, VaultError> {
        let url = self.url("data", spec);
        let body = KvWrite {
            options: KvOptions { cas },
            data,
        };
        // KV v2 answers a write with the new version's metadata
        #[derive(Deserialize)]
        struct Written {
            data: KvVersion,
        }
        let written: Written = self
            .caller
            .json(|http| self.authed(http, Method::POST, &url).json(&body))
            .await?;
        Ok(written.data.version)
    }
}

#[async_trait]
impl Vault for HashiCorp {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn get_item(&self, spec: &VaultSpec) -> Result<VaultItem, VaultError> {
        let data = self.read(spec).await?;
        let value = data
            .data
            .as_ref()
            .and_then(|d| d.get(&spec.field))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if value.is_empty() {
            debug!(mount = %spec.path, item = %spec.item, field = %spec.field, "field missing or empty");
            return Err(VaultError::ItemNotFound);
        }

        Ok(VaultItem {
            name: spec.item.clone(),
            path: spec.path.clone(),
            field: spec.field.clone(),
            value: value.to_string(),
        })
    }

    async fn create_item(&self, spec: &VaultSpec, value: &str) -> Result<VaultItem, VaultError> {
        let item = VaultItem {
            name: spec.item.clone(),
            path: spec.path.clone(),
            field: spec.field.clone(),
            value: value.to_string(),
        };

        // the secret may exist without the field, or with its latest version deleted
        let (mut data, cas) = match self.current_version(spec).await? {
            None => (Map::new(), 0),
            Some(version) => match self.read(spec).await {
                Ok(current) => (current.data.unwrap_or_default(), version),
                Err(VaultError::ItemNotFound) => (Map::new(), version),
                Err(e) => return Err(e),
            },
        };

        debug!(mount = %spec.path, item = %spec.item, cas, "creating secret in hashicorp vault");
        if self.dry_run {
            info!(mount = %spec.path, item = %spec.item, "dry-run flag set, not creating hashicorp vault secret");
            return Ok(item);
        }

        data.insert(spec.field.clone(), Value::String(value.to_string()));
        let version = self.write(spec, &data, cas).await?;
        debug!(mount = %spec.path, item = %spec.item, version, "created secret in hashicorp vault");
        Ok(item)
    }

    async fn update_item(&self, spec: &VaultSpec, value: &str) -> Result<(), VaultError> {
        let current = self.read(spec).await?;

        debug!(mount = %spec.path, item = %spec.item, "updating secret in hashicorp vault");
        if self.dry_run {
            info!(mount = %spec.path, item = %spec.item, "dry-run flag set, not updating hashicorp vault secret");
            return Ok(());
        }

        let mut data = current.data.unwrap_or_default();
        data.insert(spec.field.clone(), Value::String(value.to_string()));
        let version = self.write(spec, &data, current.metadata.version).await?;
        debug!(mount = %spec.path, item = %spec.item, version, "updated secret in hashicorp vault");
        Ok(())
    }

    async fn delete_item(&self, spec: &VaultSpec) -> Result<(), VaultError> {
        // metadata deletes succeed on missing secrets, so check first
        if self.current_version(spec).await?.is_none() {
            return Err(VaultError::ItemNotFound);
        }
        let url = self.url("metadata", spec);

        debug!(mount = %spec.path, item = %spec.item, "deleting secret in hashicorp vault");
        if self.dry_run {
            info!(mount = %spec.path, item = %spec.item, "dry-run flag set, not deleting hashicorp vault secret");
            return Ok(());
        }

        self.caller
            .empty(|http| self.authed(http, Method::DELETE, &url))
            .await
            .map_err(missing_as_not_found)?;
        debug!(mount = %spec.path, item = %spec.item, "deleted secret in hashicorp vault");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hashicorp(server: &MockServer, dry_run: bool) -> HashiCorp {
        let backoff = Backoff {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
            max_elapsed: Duration::from_secs(5),
            jitter: Duration::ZERO,
        };
        let caller = Caller::new(backoff, CancellationToken::new()).unwrap();
        HashiCorp::new(&server.uri(), "hvs.token", caller)
            .unwrap()
            .with_dry_run(dry_run)
    }

    fn spec() -> VaultSpec {
        VaultSpec {
            path: "secret".into(),
            item: "gitlab/ci".into(),
            field: "token".into(),
            path_id: None,
            item_id: None,
        }
    }

    fn secret(version: u64, value: &str) -> Value {
        json!({
            "data": {
                "data": {"token": value, "user": "bot"},
                "metadata": {"version": version, "destroyed": false}
            }
        })
    }

    #[tokio::test]
    async fn test_get_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .and(header("X-Vault-Token", "hvs.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret(2, "glpat-abc")))
            .mount(&server)
            .await;

        let item = hashicorp(&server, false).get_item(&spec()).await.unwrap();
        assert_eq!(item.value, "glpat-abc");
    }

    #[tokio::test]
    async fn test_get_missing_secret_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": []})))
            .expect(1)
            .mount(&server)
            .await;

        let err = hashicorp(&server, false).get_item(&spec()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_uses_cas_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .and(body_json(json!({"options": {"cas": 0}, "data": {"token": "glpat-new"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 1}})))
            .expect(1)
            .mount(&server)
            .await;

        let item = hashicorp(&server, false)
            .create_item(&spec(), "glpat-new")
            .await
            .unwrap();
        assert_eq!(item.value, "glpat-new");
    }

    #[tokio::test]
    async fn test_create_over_secret_without_field_uses_current_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"current_version": 3}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"data": {"user": "bot"}, "metadata": {"version": 3}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .and(body_json(json!({
                "options": {"cas": 3},
                "data": {"user": "bot", "token": "glpat-new"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 4}})))
            .expect(1)
            .mount(&server)
            .await;

        let vault = hashicorp(&server, false);
        assert!(vault.get_item(&spec()).await.unwrap_err().is_not_found());
        let item = vault.create_item(&spec(), "glpat-new").await.unwrap();
        assert_eq!(item.value, "glpat-new");
    }

    #[tokio::test]
    async fn test_create_over_deleted_latest_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"current_version": 7}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .and(body_json(json!({"options": {"cas": 7}, "data": {"token": "glpat-new"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 8}})))
            .expect(1)
            .mount(&server)
            .await;

        hashicorp(&server, false)
            .create_item(&spec(), "glpat-new")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_merges_and_checks_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret(4, "old")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .and(body_json(json!({
                "options": {"cas": 4},
                "data": {"token": "glpat-new", "user": "bot"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 5}})))
            .expect(1)
            .mount(&server)
            .await;

        hashicorp(&server, false)
            .update_item(&spec(), "glpat-new")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_missing_secret_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/gitlab/ci"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let err = hashicorp(&server, false).delete_item(&spec()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_mutations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(secret(1, "old")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/gitlab/ci"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"current_version": 1}})))
            .mount(&server)
            .await;
        for verb in ["POST", "DELETE"] {
            Mock::given(method(verb))
                .respond_with(ResponseTemplate::new(500))
                .expect(0)
                .mount(&server)
                .await;
        }

        let vault = hashicorp(&server, true);
        vault.create_item(&spec(), "glpat-dry").await.unwrap();
        vault.update_item(&spec(), "glpat-dry").await.unwrap();
        vault.delete_item(&spec()).await.unwrap();
    }
}
