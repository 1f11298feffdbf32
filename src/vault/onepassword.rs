//! 1Password Connect server backend.
//!
//! Vaults are matched by `path_id` when set, otherwise by name; items by
//! `item_id` or title; the secret lives in the field whose label is `field`.

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

const CATEGORY_LOGIN: &str = "LOGIN";
const FIELD_CONCEALED: &str = "CONCEALED";

#[derive(Debug, Deserialize)]
struct VaultOverview {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ItemOverview {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultRef {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Field {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    /// Keeps attributes we don't model intact across a PUT.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FullItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    title: String,
    category: String,
    vault: VaultRef,
    #[serde(default)]
    fields: Vec<Field>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl FullItem {
    fn field_value(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label == label)
            .and_then(|f| f.value.as_deref())
    }
}

pub struct OnePassword {
    base: String,
    token: String,
    dry_run: bool,
    caller: Caller,
}

impl OnePassword {
    pub fn new(base_url: &str, token: impl Into<String>, caller: Caller) -> Result<Self, VaultError> {
        let parsed = Url::parse(base_url).map_err(|e| {
            VaultError::InvalidItem(format!("invalid 1Password Connect URL '{}': {}", base_url, e))
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

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path)
    }

    fn authed(&self, http: &Client, method: Method, url: &str) -> RequestBuilder {
        http.request(method, url).bearer_auth(&self.token)
    }

    async fn find_vault(&self, spec: &VaultSpec) -> Result<VaultOverview, VaultError> {
        let url = self.url("vaults");
        let vaults: Vec<VaultOverview> = self
            .caller
            .json(|http| self.authed(http, Method::GET, &url))
            .await?;

        vaults
            .into_iter()
            .find(|v| match &spec.path_id {
                Some(id) => &v.id == id,
                None => v.name == spec.path,
            })
            .ok_or_else(|| VaultError::VaultNotFound(spec.path.clone()))
    }

    async fn find_item(&self, vault_id: &str, spec: &VaultSpec) -> Result<ItemOverview, VaultError> {
        let url = self.url(&format!("vaults/{}/items", vault_id));
        let items: Vec<ItemOverview> = self
            .caller
            .json(|http| self.authed(http, Method::GET, &url))
            .await?;

        items
            .into_iter()
            .find(|i| match &spec.item_id {
                Some(id) => &i.id == id,
                None => i.title == spec.item,
            })
            .ok_or(VaultError::ItemNotFound)
    }

    async fn fetch(&self, vault_id: &str, item_id: &str) -> Result<FullItem, VaultError> {
        let url = self.url(&format!("vaults/{}/items/{}", vault_id, item_id));
        let item = self
            .caller
            .json(|http| self.authed(http, Method::GET, &url))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound => VaultError::ItemNotFound,
                other => VaultError::Remote(other),
            })?;
        Ok(item)
    }

    /// Set `spec.field` on an existing item, adding the field if it is missing.
    async fn write_field(
        &self,
        vault_id: &str,
        item_id: &str,
        spec: &VaultSpec,
        value: &str,
    ) -> Result<FullItem, VaultError> {
        let mut item = self.fetch(vault_id, item_id).await?;
        match item.fields.iter_mut().find(|f| f.label == spec.field) {
            Some(field) => field.value = Some(value.to_string()),
            None => item.fields.push(Field {
                id: spec.field.clone(),
                label: spec.field.clone(),
                field_type: FIELD_CONCEALED.to_string(),
                value: Some(value.to_string()),
                extra: Map::new(),
            }),
        }

        let url = self.url(&format!("vaults/{}/items/{}", vault_id, item_id));
        let updated: FullItem = self
            .caller
            .json(|http| self.authed(http, Method::PUT, &url).json(&item))
            .await?;
        Ok(updated)
    }
}

#[async_trait]
impl Vault for OnePassword {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    async fn get_item(&self, spec: &VaultSpec) -> Result<VaultItem, VaultError> {
        let vault = self.find_vault(spec).await?;
        let overview = self.find_item(&vault.id, spec).await?;
        let item = self.fetch(&vault.id, &overview.id).await?;

        let value = item.field_value(&spec.field).unwrap_or_default();
        if value.is_empty() {
            debug!(vault = %vault.id, item = %spec.item, field = %spec.field, "field missing or empty");
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
        let vault = self.find_vault(spec).await?;
        // an item without the field reads as missing; fill it instead of adding a twin
        let existing = match self.find_item(&vault.id, spec).await {
            Ok(overview) => Some(overview),
            Err(VaultError::ItemNotFound) => None,
            Err(e) => return Err(e),
        };

        debug!(vault = %vault.id, item = %spec.item, "creating item in 1password vault");
        if self.dry_run {
            info!(vault = %vault.id, item = %spec.item, "dry-run flag set, not creating 1password vault item");
            return Ok(VaultItem {
                name: spec.item.clone(),
                path: vault.id,
                field: spec.field.clone(),
                value: value.to_string(),
            });
        }

        if let Some(overview) = existing {
            debug!(vault = %vault.id, item = %overview.id, "item already exists, setting field in place");
            let updated = self.write_field(&vault.id, &overview.id, spec, value).await?;
            return Ok(VaultItem {
                name: updated.title.clone(),
                path: vault.id,
                field: spec.field.clone(),
                value: value.to_string(),
            });
        }

        let body = FullItem {
            id: None,
            title: spec.item.clone(),
            category: CATEGORY_LOGIN.to_string(),
            vault: VaultRef {
                id: vault.id.clone(),
            },
            fields: vec![Field {
                id: spec.field.clone(),
                label: spec.field.clone(),
                field_type: FIELD_CONCEALED.to_string(),
                value: Some(value.to_string()),
                extra: Map::new(),
            }],
            extra: Map::new(),
        };

        let url = self.url(&format!("vaults/{}/items", vault.id));
        let created: FullItem = self
            .caller
            .json(|http| self.authed(http, Method::POST, &url).json(&body))
            .await?;
        debug!(vault = %created.vault.id, item = %created.title, "created item in 1password vault");

        Ok(VaultItem {
            name: created.title.clone(),
            path: created.vault.id.clone(),
            field: spec.field.clone(),
            value: created.field_value(&spec.field).unwrap_or(value).to_string(),
        })
    }

    async fn update_item(&self, spec: &VaultSpec, value: &str) -> Result<(), VaultError> {
        let vault = self.find_vault(spec).await?;
        let overview = self.find_item(&vault.id, spec).await?;

        debug!(vault = %vault.id, item = %spec.item, "updating item in 1password vault");
        if self.dry_run {
            info!(vault = %vault.id, item = %spec.item, "dry-run flag set, not updating 1password vault item");
            return Ok(());
        }

        self.write_field(&vault.id, &overview.id, spec, value).await?;
        debug!(vault = %vault.id, item = %spec.item, "updated item in 1password vault");
        Ok(())
    }

    async fn delete_item(&self, spec: &VaultSpec) -> Result<(), VaultError> {
        let vault = self.find_vault(spec).await?;
        let overview = self.find_item(&vault.id, spec).await?;

        debug!(vault = %vault.id, item = %spec.item, "deleting item in 1password vault");
        if self.dry_run {
            info!(vault = %vault.id, item = %spec.item, "dry-run flag set, not deleting 1password vault item");
            return Ok(());
        }

        let url = self.url(&format!("vaults/{}/items/{}", vault.id, overview.id));
        self.caller
            .empty(|http| self.authed(http, Method::DELETE, &url))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound => VaultError::ItemNotFound,
                other => VaultError::Remote(other),
            })?;
        debug!(vault = %vault.id, item = %spec.item, "deleted item in 1password vault");
        Ok(())
    }
}
