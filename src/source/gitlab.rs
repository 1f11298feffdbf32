//! GitLab access tokens (personal, project and group) over the REST API v4.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::Source;
use crate::errors::SourceError;
use crate::models::{SourceSpec, Token, TokenConfig, TokenType};
use crate::remote::{Caller, RemoteError};

pub const DEFAULT_URL: &str = "https://gitlab.com/api/v4";

/// Value handed out instead of a real secret when running dry.
pub const DRY_RUN_VALUE: &str = "dry-run";

const PAGE_SIZE: &str = "100";

/// Access token as listed, created or rotated by GitLab.
#[derive(Debug, Deserialize)]
struct AccessToken {
    id: u64,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    user_id: Option<u64>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    revoked: bool,
    #[serde(default)]
    expires_at: Option<NaiveDate>,
    /// Only present on create and rotate responses.
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    description: &'a str,
    scopes: &'a [String],
    expires_at: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_level: Option<u32>,
}

#[derive(Debug, Serialize)]
struct RotateRequest {
    expires_at: NaiveDate,
}

/// Token source backed by a GitLab instance.
pub struct GitLab {
    base: String,
    token: String,
    dry_run: bool,
    caller: Caller,
}

impl GitLab {
    pub fn new(base_url: &str, token: impl Into<String>, caller: Caller) -> Result<Self, SourceError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| SourceError::InvalidSpec(format!("invalid GitLab URL '{}': {}", base_url, e)))?;
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
        format!("{}/{}", self.base, path)
    }

    fn authed(&self, http: &Client, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        http.request(method, url).header("PRIVATE-TOKEN", &self.token)
    }

    /// Collection path listing tokens of the given kind.
    fn collection(spec: &SourceSpec) -> Result<String, SourceError> {
        match spec.token_type {
            TokenType::Personal => Ok("personal_access_tokens".to_string()),
            TokenType::Project | TokenType::Group => {
                if spec.owner.is_empty() {
                    return Err(SourceError::InvalidSpec(format!(
                        "{} token '{}' needs an owner",
                        spec.token_type, spec.name
                    )));
                }
                let kind = if spec.token_type == TokenType::Project {
                    "projects"
                } else {
                    "groups"
                };
                Ok(format!(
                    "{}/{}/access_tokens",
                    kind,
                    urlencoding::encode(&spec.owner)
                ))
            }
        }
    }

    /// User ID a personal token belongs to; `None` means the caller's own tokens.
    fn personal_owner(spec: &SourceSpec) -> Result<Option<u64>, SourceError> {
        if spec.token_type != TokenType::Personal || spec.owner.is_empty() {
            return Ok(None);
        }
        spec.owner.parse().map(Some).map_err(|_| {
            SourceError::InvalidSpec(format!(
                "personal token '{}' owner must be a user ID, got '{}'",
                spec.name, spec.owner
            ))
        })
    }

    /// Active token whose name matches exactly; GitLab's search is a substring match.
    async fn find(&self, spec: &SourceSpec) -> Result<AccessToken, SourceError> {
        let url = self.url(&Self::collection(spec)?);
        let user_id = Self::personal_owner(spec)?;
        let mut query = vec![
            ("state", "active".to_string()),
            ("per_page", PAGE_SIZE.to_string()),
        ];
        if spec.token_type == TokenType::Personal {
            query.push(("search", spec.name.clone()));
        }
        // admins list every user's tokens unless narrowed down
        if let Some(uid) = user_id {
            query.push(("user_id", uid.to_string()));
        }

        let mut page = 1;
        loop {
            let (tokens, next): (Vec<AccessToken>, _) = self
                .caller
                .json_page(|http| {
                    self.authed(http, reqwest::Method::GET, &url)
                        .query(&query)
                        .query(&[("page", page)])
                })
                .await?;

            // inactive tokens cannot be rotated
            let found = tokens.into_iter().find(|t| {
                t.name == spec.name
                    && !t.revoked
                    && t.active.unwrap_or(true)
                    && user_id.map_or(true, |uid| t.user_id == Some(uid))
            });
            if let Some(found) = found {
                debug!(name = %found.name, id = found.id, page, "matching {} token", spec.token_type);
                return Ok(found);
            }

            match next {
                Some(n) if n > page => page = n,
                _ => return Err(SourceError::TokenNotFound),
            }
        }
    }

    fn to_token(&self, spec: &SourceSpec, at: AccessToken) -> Token {
        let owner = match (spec.token_type, at.user_id) {
            (TokenType::Personal, Some(uid)) => uid.to_string(),
            _ => spec.owner.clone(),
        };
        Token {
            name: at.name,
            description: at.description.unwrap_or_default(),
            scopes: at.scopes,
            token_type: spec.token_type,
            owner,
            value: at.token.unwrap_or_default(),
            expiration: at.expires_at.map(midnight_utc).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn dry_run_token(&self, cfg: &TokenConfig, owner: String) -> Result<Token, SourceError> {
        let expires_at = expiry_date(cfg.rotation.validity)?;
        Ok(Token {
            name: cfg.source.name.clone(),
            description: cfg.source.description.clone(),
            scopes: cfg.source.scopes.clone(),
            token_type: cfg.source.token_type,
            owner,
            value: DRY_RUN_VALUE.to_string(),
            expiration: midnight_utc(expires_at),
        })
    }
}

#[async_trait]
impl Source for GitLab {
    async fn get_token(&self, spec: &SourceSpec) -> Result<Token, SourceError> {
        let found = self.find(spec).await?;
        Ok(self.to_token(spec, found))
    }

    async fn create_token(&self, cfg: &TokenConfig) -> Result<Token, SourceError> {
        let spec = &cfg.source;
        let path = match spec.token_type {
            TokenType::Personal => match Self::personal_owner(spec)? {
                Some(uid) => format!("users/{}/personal_access_tokens", uid),
                None => "user/personal_access_tokens".to_string(),
            },
            TokenType::Project | TokenType::Group => Self::collection(spec)?,
        };
        let access_level = match spec.token_type {
            TokenType::Personal => None,
            _ => Some(access_level(&spec.role)?),
        };
        let body = CreateRequest {
            name: &spec.name,
            description: &spec.description,
            scopes: &spec.scopes,
            expires_at: expiry_date(cfg.rotation.validity)?,
            access_level,
        };

        if self.dry_run {
            info!(name = %spec.name, "dry-run flag set, not creating {} token", spec.token_type);
            return self.dry_run_token(cfg, spec.owner.clone());
        }

        let url = self.url(&path);
        let created: AccessToken = self
            .caller
            .json(|http| self.authed(http, reqwest::Method::POST, &url).json(&body))
            .await?;
        debug!(name = %created.name, id = created.id, "created {} token", spec.token_type);

        require_value(&created)?;
        Ok(self.to_token(spec, created))
    }

    async fn rotate_token(&self, cfg: &TokenConfig) -> Result<Token, SourceError> {
        let spec = &cfg.source;
        // rotation needs the token ID, so the token has to exist and be active
        let current = self.find(spec).await?;
        let body = RotateRequest {
            expires_at: expiry_date(cfg.rotation.validity)?,
        };

        if self.dry_run {
            info!(name = %spec.name, id = current.id, "dry-run flag set, not rotating {} token", spec.token_type);
            let owner = self.to_token(spec, current).owner.clone();
            return self.dry_run_token(cfg, owner);
        }

        let url = self.url(&format!("{}/{}/rotate", Self::collection(spec)?, current.id));
        let rotated: AccessToken = self
            .caller
            .json(|http| self.authed(http, reqwest::Method::POST, &url).json(&body))
            .await?;
        debug!(name = %rotated.name, id = rotated.id, "rotated {} token", spec.token_type);

        require_value(&rotated)?;
        Ok(self.to_token(spec, rotated))
    }

    async fn delete_token(&self, spec: &SourceSpec) -> Result<(), SourceError> {
        let current = self.find(spec).await?;

        if self.dry_run {
            info!(name = %spec.name, id = current.id, "dry-run flag set, not revoking {} token", spec.token_type);
            return Ok(());
        }

        let url = self.url(&format!("{}/{}", Self::collection(spec)?, current.id));
        self.caller
            .empty(|http| self.authed(http, reqwest::Method::DELETE, &url))
            .await?;
        debug!(name = %spec.name, id = current.id, "revoked {} token", spec.token_type);
        Ok(())
    }
}

/// GitLab access level for a role name.
pub fn access_level(role: &str) -> Result<u32, SourceError> {
    match role.to_ascii_lowercase().as_str() {
        "guest" => Ok(10),
        "planner" => Ok(15),
        "reporter" => Ok(20),
        "developer" => Ok(30),
        "maintainer" => Ok(40),
        "owner" => Ok(50),
        "" => Err(SourceError::InvalidSpec("missing token role".into())),
        other => Err(SourceError::InvalidSpec(format!("unknown role '{}'", other))),
    }
}

/// Create and rotate must hand back the plaintext, it is never readable again.
fn require_value(at: &AccessToken) -> Result<(), SourceError> {
    match at.token.as_deref() {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(SourceError::Remote(RemoteError::Decode(format!(
            "no token value returned for '{}'",
            at.name
        )))),
    }
}

fn expiry_date(validity: Duration) -> Result<NaiveDate, SourceError> {
    let validity = chrono::Duration::from_std(validity)
        .map_err(|_| SourceError::InvalidSpec("validity out of range".into()))?;
    Utc::now()
        .checked_add_signed(validity)
        .map(|t| t.date_naive())
        .ok_or_else(|| SourceError::InvalidSpec("validity out of range".into()))
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Rotation, TokenState, VaultSpec};
    use crate::retry::Backoff;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gitlab(server: &MockServer, dry_run: bool) -> GitLab {
        let backoff = Backoff {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
            max_elapsed: Duration::from_secs(5),
            jitter: Duration::ZERO,
        };
        let caller = Caller::new(backoff, CancellationToken::new()).unwrap();
        GitLab::new(&server.uri(), "admin-token", caller)
            .unwrap()
            .with_dry_run(dry_run)
    }

    fn config(token_type: TokenType, owner: &str, role: &str) -> TokenConfig {
        TokenConfig {
            name: "ci".into(),
            state: TokenState::Active,
            rotation: Rotation {
                rotate_before: Duration::from_secs(24 * 3600),
                validity: Duration::from_secs(7 * 24 * 3600),
            },
            source: SourceSpec {
                name: "ci".into(),
                description: "ci pipeline".into(),
                token_type,
                owner: owner.into(),
                role: role.into(),
                scopes: vec!["api".into()],
            },
            vault: VaultSpec {
                path: "ops".into(),
                item: "ci".into(),
                field: "password".into(),
                path_id: None,
                item_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_get_token_matches_exact_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/personal_access_tokens"))
            .and(query_param("search", "ci"))
            .and(header("PRIVATE-TOKEN", "admin-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "ci-old", "scopes": ["api"], "active": true, "revoked": false, "expires_at": "2030-01-01"},
                {"id": 2, "name": "ci", "scopes": ["api"], "user_id": 7, "active": true, "revoked": false, "expires_at": "2030-06-15"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Personal, "", "");
        let tok = gitlab(&server, false).get_token(&cfg.source).await.unwrap();
        assert_eq!(tok.name, "ci");
        assert_eq!(tok.owner, "7");
        assert!(tok.value.is_empty());
        assert_eq!(tok.expiration.to_rfc3339(), "2030-06-15T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_get_token_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/personal_access_tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "name": "ci", "active": false, "revoked": true}
            ])))
            .mount(&server)
            .await;

        let cfg = config(TokenType::Personal, "", "");
        let err = gitlab(&server, false).get_token(&cfg.source).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rotate_personal_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/personal_access_tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 42, "name": "ci", "active": true, "revoked": false, "expires_at": "2030-01-01"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/personal_access_tokens/42/rotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(
                {"id": 43, "name": "ci", "active": true, "revoked": false, "expires_at": "2030-01-08", "token": "glpat-rotated"}
            )))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Personal, "", "");
        let tok = gitlab(&server, false).rotate_token(&cfg).await.unwrap();
        assert_eq!(tok.value, "glpat-rotated");
    }

    #[tokio::test]
    async fn test_create_project_token_encodes_owner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/group%2Fproject/access_tokens"))
            .and(body_partial_json(json!({"name": "ci", "access_level": 40, "scopes": ["api"]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!(
                {"id": 9, "name": "ci", "scopes": ["api"], "active": true, "revoked": false, "expires_at": "2030-01-08", "token": "glpat-new"}
            )))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Project, "group/project", "maintainer");
        let tok = gitlab(&server, false).create_token(&cfg).await.unwrap();
        assert_eq!(tok.value, "glpat-new");
        assert_eq!(tok.owner, "group/project");
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/platform/access_tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 5, "name": "ci", "active": true, "revoked": false, "expires_at": "2030-01-01"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let gl = gitlab(&server, true);
        let cfg = config(TokenType::Group, "platform", "developer");
        assert_eq!(gl.create_token(&cfg).await.unwrap().value, DRY_RUN_VALUE);
        assert_eq!(gl.rotate_token(&cfg).await.unwrap().value, DRY_RUN_VALUE);
        gl.delete_token(&cfg.source).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_unauthorized_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/personal_access_tokens"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Personal, "", "");
        let err = gitlab(&server, false).delete_token(&cfg.source).await.unwrap_err();
        assert!(matches!(err, SourceError::Remote(RemoteError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_delete_personal_token_of_owner_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/personal_access_tokens"))
            .and(query_param("user_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 99, "name": "ci", "user_id": 1, "active": true, "revoked": false},
                {"id": 7, "name": "ci", "user_id": 42, "active": true, "revoked": false}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/personal_access_tokens/7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/personal_access_tokens/99"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Personal, "42", "");
        gitlab(&server, false).delete_token(&cfg.source).await.unwrap();
    }

    #[tokio::test]
    async fn test_personal_owner_must_be_user_id() {
        let server = MockServer::start().await;
        let cfg = config(TokenType::Personal, "deployer", "");
        let err = gitlab(&server, false).get_token(&cfg.source).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn test_get_token_follows_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/42/access_tokens"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-next-page", "2")
                    .set_body_json(json!([
                        {"id": 1, "name": "deploy", "active": true, "revoked": false}
                    ])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/projects/42/access_tokens"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-next-page", "")
                    .set_body_json(json!([
                        {"id": 2, "name": "ci", "active": true, "revoked": false, "expires_at": "2030-03-01"}
                    ])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Project, "42", "developer");
        let tok = gitlab(&server, false).get_token(&cfg.source).await.unwrap();
        assert_eq!(tok.name, "ci");
        assert_eq!(tok.expiration.to_rfc3339(), "2030-03-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_get_token_stops_after_last_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/platform/access_tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "deploy", "active": true, "revoked": false}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = config(TokenType::Group, "platform", "developer");
        let err = gitlab(&server, false).get_token(&cfg.source).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_project_token_requires_owner() {
        let server = MockServer::start().await;
        let cfg = config(TokenType::Project, "", "developer");
        let err = gitlab(&server, false).get_token(&cfg.source).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidSpec(_)));
    }

    #[test]
    fn test_access_levels() {
        assert_eq!(access_level("Maintainer").unwrap(), 40);
        assert_eq!(access_level("reporter").unwrap(), 20);
        assert!(access_level("admin").is_err());
        assert!(access_level("").is_err());
    }
}
