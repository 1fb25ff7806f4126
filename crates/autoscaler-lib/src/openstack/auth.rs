//! Keystone v3 authentication and service catalog

use super::config::{CloudConfig, Credentials};
use super::{error_for_status, transport_error};
use crate::error::{ProviderError, ProviderResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Tokens this close to expiry are renewed before use.
const RENEW_BEFORE_EXPIRY_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

/// Services and endpoints returned with a token
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ServiceCatalog {
    services: Vec<CatalogService>,
}

impl ServiceCatalog {
    /// Public endpoint of a service type, restricted to `region` when given.
    pub fn endpoint(&self, service_type: &str, region: Option<&str>) -> Option<String> {
        self.services
            .iter()
            .filter(|service| service.service_type == service_type)
            .flat_map(|service| service.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == "public"
                    && region.map_or(true, |r| {
                        endpoint.region.as_deref() == Some(r) || endpoint.region_id.as_deref() == Some(r)
                    })
            })
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    catalog: ServiceCatalog,
}

#[derive(Debug, Clone)]
struct Token {
    id: String,
    expires_at: Option<DateTime<Utc>>,
    catalog: ServiceCatalog,
}

impl Token {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map_or(true, |at| at - now > ChronoDuration::seconds(RENEW_BEFORE_EXPIRY_SECS))
    }
}

/// `<auth-url>/auth/tokens`, adding the `v3` path segment when missing
pub fn tokens_url(auth_url: &str) -> ProviderResult<Url> {
    let trimmed = auth_url.trim().trim_end_matches('/');
    let base = if trimmed.ends_with("/v3") {
        trimmed.to_string()
    } else {
        format!("{}/v3", trimmed)
    };
    Url::parse(&format!("{}/auth/tokens", base))
        .map_err(|e| ProviderError::Rejected(format!("invalid auth-url {:?}: {}", auth_url, e)))
}

fn project_scope(config: &CloudConfig) -> Option<Value> {
    let global = &config.global;
    if let Some(id) = global.project_id.as_deref().filter(|id| !id.is_empty()) {
        return Some(json!({ "project": { "id": id } }));
    }
    global
        .project_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .map(|name| {
            json!({
                "project": { "name": name, "domain": { "name": config.project_domain() } }
            })
        })
}

/// Token request body for password and trust credentials
pub fn password_request(config: &CloudConfig) -> Option<Value> {
    let (username, password, trust_id) = match &config.credentials {
        Credentials::Password { username, password } => (username, password, None),
        Credentials::Trust {
            username,
            password,
            trust_id,
        } => (username, password, Some(trust_id)),
        Credentials::TokenFile(_) => return None,
    };

    let mut auth = json!({
        "identity": {
            "methods": ["password"],
            "password": {
                "user": {
                    "name": username,
                    "password": password,
                    "domain": { "name": config.user_domain() }
                }
            }
        }
    });
    let scope = match trust_id {
        Some(trust_id) => Some(json!({ "OS-TRUST:trust": { "id": trust_id } })),
        None => project_scope(config),
    };
    if let Some(scope) = scope {
        auth["scope"] = scope;
    }
    Some(json!({ "auth": auth }))
}

/// Issues and caches Keystone tokens
pub struct KeystoneAuth {
    http: reqwest::Client,
    config: CloudConfig,
    token: Mutex<Option<Token>>,
}

impl KeystoneAuth {
    pub fn new(http: reqwest::Client, config: CloudConfig) -> Self {
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Returns a valid token id, authenticating if needed.
    pub async fn token(&self) -> ProviderResult<String> {
        Ok(self.current().await?.id)
    }

    /// Public endpoint of a service in the configured region
    pub async fn endpoint(&self, service_type: &str) -> ProviderResult<String> {
        let token = self.current().await?;
        token
            .catalog
            .endpoint(service_type, self.config.region())
            .ok_or_else(|| {
                ProviderError::NotFound(format!(
                    "no public {} endpoint in region {:?}",
                    service_type,
                    self.config.region()
                ))
            })
    }

    /// Drops the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    async fn current(&self) -> ProviderResult<Token> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
            debug!("Keystone token is about to expire, renewing");
        }
        let token = self.authenticate().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn authenticate(&self) -> ProviderResult<Token> {
        let url = tokens_url(&self.config.global.auth_url)?;

        let (token_id, response) = match &self.config.credentials {
            Credentials::TokenFile(path) => {
                let token_id = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ProviderError::Rejected(format!("reading token file {:?}: {}", path, e)))?
                    .trim()
                    .to_string();
                // Validate the pre-issued token and fetch its catalog.
                let response = self
                    .http
                    .get(url)
                    .header("X-Auth-Token", &token_id)
                    .header(SUBJECT_TOKEN_HEADER, &token_id)
                    .send()
                    .await
                    .map_err(|e| transport_error("validate token", e))?;
                (Some(token_id), response)
            }
            _ => {
                let body = password_request(&self.config)
                    .ok_or_else(|| ProviderError::Rejected("no password credentials".into()))?;
                let response = self
                    .http
                    .post(url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| transport_error("authenticate", e))?;
                (None, response)
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, "authenticate", &body));
        }
        let id = match token_id {
            Some(id) => id,
            None => response
                .headers()
                .get(SUBJECT_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ProviderError::Rejected("token response without X-Subject-Token".into()))?,
        };
        let body: TokenBody = response
            .json()
            .await
            .map_err(|e| transport_error("authenticate", e))?;

        info!(expires_at = ?body.token.expires_at, "Authenticated with Keystone");
        Ok(Token {
            id,
            expires_at: body.token.expires_at,
            catalog: body.token.catalog,
        })
    }
}
