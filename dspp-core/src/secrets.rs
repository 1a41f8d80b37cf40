//! Secret backends feeding the interpolation scope.
//!
//! Fragments list their backends under the top-level `x-secrets` key. Each
//! backend yields a mapping; the mappings are deep-merged in declaration order
//! and exposed to interpolation as `secrets`. A backend without usable
//! credentials contributes nothing unless it is marked `mandatory`.

use crate::document::loader::parse_fragment;
use crate::document::{self, deep_merge};
use crate::error::{DsppError, Result};
use crate::paths;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Top-level key listing secret backends.
pub const SECRETS_KEY: &str = "x-secrets";

/// A vault path to read, optionally nested under `dest` in the result.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretPath {
    Plain(String),
    Nested {
        path: String,
        #[serde(default)]
        dest: String,
    },
}

impl SecretPath {
    pub fn parts(&self) -> (&str, &str) {
        match self {
            SecretPath::Plain(path) => (path, ""),
            SecretPath::Nested { path, dest } => (path, dest),
        }
    }
}

/// `secret_path`: one path or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretPaths {
    One(SecretPath),
    Many(Vec<SecretPath>),
}

impl Default for SecretPaths {
    fn default() -> Self {
        SecretPaths::Many(Vec::new())
    }
}

impl SecretPaths {
    pub fn iter(&self) -> std::slice::Iter<'_, SecretPath> {
        match self {
            SecretPaths::One(path) => std::slice::from_ref(path).iter(),
            SecretPaths::Many(paths) => paths.iter(),
        }
    }
}

/// How to authenticate against vault.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultAuth {
    /// Pre-supplied token
    #[serde(default)]
    pub token: Option<String>,
    /// JWT exchanged for a token at `auth/<jwt_mount>/login`
    #[serde(default)]
    pub jwt: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_jwt_mount")]
    pub jwt_mount: String,
    /// SSH-agent challenge signing; recognised but not supported
    #[serde(default)]
    pub ssh: Option<Value>,
}

fn default_jwt_mount() -> String {
    "jwt".to_string()
}

/// One entry of `x-secrets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum SecretSource {
    File {
        file_path: String,
        #[serde(default)]
        mandatory: bool,
    },
    Vault {
        #[serde(default)]
        vault_addr: Option<String>,
        #[serde(default)]
        secret_path: SecretPaths,
        #[serde(default)]
        auth: VaultAuth,
        #[serde(default)]
        mandatory: bool,
    },
}

/// Read the `x-secrets` list of a document.
pub fn sources(doc: &Value) -> Result<Vec<SecretSource>> {
    let Some(list) = doc.get(SECRETS_KEY).filter(|v| !v.is_null()) else { return Ok(Vec::new()) };
    serde_yaml::from_value(list.clone())
        .map_err(|e| DsppError::InvalidConfig { reason: format!("{}: {}", SECRETS_KEY, e) })
}

/// Resolves secret backends into one key/value tree.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn resolve(&self, sources: &[SecretSource]) -> Result<Value>;
}

/// Provider that never yields secrets.
#[derive(Debug, Default, Clone)]
pub struct NoSecrets;

#[async_trait]
impl SecretsProvider for NoSecrets {
    async fn resolve(&self, _sources: &[SecretSource]) -> Result<Value> {
        Ok(Value::Mapping(Mapping::new()))
    }
}

/// File and vault backends.
#[derive(Debug, Clone)]
pub struct DefaultSecretsProvider {
    project_root: PathBuf,
    client: Client,
    env: fn(&str) -> Option<String>,
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Insert `body` under the dotted `dest` path of `into`.
fn merge_at(into: &mut Value, dest: &str, body: Value) {
    let mut nested = body;
    for key in dest.split('.').filter(|k| !k.is_empty()).rev() {
        let mut map = Mapping::new();
        map.insert(Value::from(key), nested);
        nested = Value::Mapping(map);
    }
    deep_merge(into, nested);
}

fn unavailable(path: &str, status: Option<u16>, reason: impl ToString) -> DsppError {
    DsppError::RemoteUnavailable { path: path.to_string(), status, reason: reason.to_string() }
}

impl DefaultSecretsProvider {
    pub fn new(project_root: &Path) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build().map_err(|e| {
            DsppError::InvalidConfig { reason: format!("Failed to create HTTP client: {}", e) }
        })?;
        Ok(Self { project_root: project_root.to_path_buf(), client, env: process_env })
    }

    /// Replace the environment lookup (`VAULT_ADDR`, `VAULT_TOKEN`).
    pub fn with_env(mut self, env: fn(&str) -> Option<String>) -> Self {
        self.env = env;
        self
    }

    fn read_file(&self, file_path: &str, mandatory: bool) -> Result<Value> {
        let path = paths::resolve_from(&self.project_root, &self.project_root, file_path)?;
        if !path.exists() && !mandatory {
            warn!(path = %path.display(), "Secrets file not found, skipping");
            return Ok(Value::Null);
        }
        let body = std::fs::read_to_string(&path).map_err(|e| DsppError::io(&path, e))?;
        parse_fragment(&path, &body)
    }

    async fn vault_token(&self, addr: &str, auth: &VaultAuth) -> Result<Option<String>> {
        if let Some(token) = auth.token.clone().or_else(|| (self.env)("VAULT_TOKEN")) {
            return Ok(Some(token));
        }

        if let Some(jwt) = &auth.jwt {
            let url = format!("{}/v1/auth/{}/login", addr, auth.jwt_mount);
            let body = serde_json::json!({ "jwt": jwt, "role": auth.role });
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| DsppError::RemoteAuthFailure { backend: url.clone(), reason: e.to_string() })?;
            if !response.status().is_success() {
                return Err(DsppError::RemoteAuthFailure {
                    backend: url,
                    reason: format!("login returned {}", response.status()),
                });
            }
            let reply: serde_json::Value = response
                .json()
                .await
                .map_err(|e| DsppError::RemoteAuthFailure { backend: url.clone(), reason: e.to_string() })?;
            let token = reply["auth"]["client_token"].as_str().map(str::to_string);
            if token.is_none() {
                return Err(DsppError::RemoteAuthFailure {
                    backend: url,
                    reason: "login reply has no client token".to_string(),
                });
            }
            return Ok(token);
        }

        if auth.ssh.is_some() {
            debug!("SSH-agent vault authentication is not supported");
        }
        Ok(None)
    }

    async fn read_vault(
        &self,
        vault_addr: Option<&str>,
        secret_paths: &SecretPaths,
        auth: &VaultAuth,
        mandatory: bool,
    ) -> Result<Value> {
        let addr = vault_addr.map(str::to_string).or_else(|| (self.env)("VAULT_ADDR"));
        let Some(addr) = addr.map(|a| a.trim_end_matches('/').to_string()) else {
            return no_credentials("vault", "no vault address", mandatory);
        };

        let token = match self.vault_token(&addr, auth).await {
            Ok(Some(token)) => token,
            Ok(None) => return no_credentials(&addr, "no usable credentials", mandatory),
            Err(e) if !mandatory => {
                warn!(error = %e, "Vault authentication failed, skipping");
                return Ok(Value::Null);
            }
            Err(e) => return Err(e),
        };

        let mut secrets = Value::Mapping(Mapping::new());
        for secret_path in secret_paths.iter() {
            let (path, dest) = secret_path.parts();
            let (mount, rest) = path.trim_matches('/').split_once('/').unwrap_or((path, ""));
            let url = format!("{}/v1/{}/data/{}", addr, mount, rest);

            let response = self
                .client
                .get(&url)
                .header("x-vault-token", &token)
                .send()
                .await
                .map_err(|e| unavailable(path, None, e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(unavailable(path, Some(status.as_u16()), "could not retrieve vault secret"));
            }
            let reply: serde_json::Value = response.json().await.map_err(|e| unavailable(path, None, e))?;
            let body = serde_yaml::to_value(&reply["data"]["data"])
                .map_err(|e| unavailable(path, None, e))?;

            debug!(path, dest, "Read vault secret");
            merge_at(&mut secrets, dest, body);
        }
        Ok(secrets)
    }
}

fn no_credentials(backend: &str, reason: &str, mandatory: bool) -> Result<Value> {
    if mandatory {
        return Err(DsppError::RemoteAuthFailure {
            backend: backend.to_string(),
            reason: reason.to_string(),
        });
    }
    warn!(backend, reason, "Skipping optional secrets");
    Ok(Value::Null)
}

#[async_trait]
impl SecretsProvider for DefaultSecretsProvider {
    #[instrument(skip_all, fields(sources = sources.len()))]
    async fn resolve(&self, sources: &[SecretSource]) -> Result<Value> {
        let mut secrets = Value::Mapping(Mapping::new());
        for source in sources {
            let body = match source {
                SecretSource::File { file_path, mandatory } => {
                    self.read_file(file_path, *mandatory)?
                }
                SecretSource::Vault { vault_addr, secret_path, auth, mandatory } => {
                    self.read_vault(vault_addr.as_deref(), secret_path, auth, *mandatory).await?
                }
            };
            if !document::is_empty(Some(&body)) {
                deep_merge(&mut secrets, body);
            }
        }
        if let Some(map) = secrets.as_mapping() {
            info!(keys = map.len(), "Resolved secrets");
        }
        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_sources_parse() {
        let doc = yaml(
            "x-secrets:\n  - {driver: file, file_path: secrets.yml}\n  - driver: vault\n    vault_addr: https://vault\n    secret_path: [kv/app, {path: kv/db, dest: db}]\n    mandatory: true",
        );
        let list = sources(&doc).unwrap();
        assert_eq!(list.len(), 2);
        match &list[1] {
            SecretSource::Vault { secret_path, mandatory, .. } => {
                assert!(*mandatory);
                let parts: Vec<(&str, &str)> = secret_path.iter().map(SecretPath::parts).collect();
                assert_eq!(parts, vec![("kv/app", ""), ("kv/db", "db")]);
            }
            other => panic!("unexpected source: {other:?}"),
        }
        assert!(sources(&yaml("services: {}")).unwrap().is_empty());
    }

    #[test]
    fn test_merge_at_dest() {
        let mut into = yaml("{db: {host: a}}");
        merge_at(&mut into, "db", yaml("{password: p}"));
        merge_at(&mut into, "", yaml("{token: t}"));
        assert_eq!(into, yaml("{db: {host: a, password: p}, token: t}"));
    }

    #[tokio::test]
    async fn test_file_driver_merges() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.yml"), "db: {user: app}\n").unwrap();
        std::fs::write(temp.path().join("b.yml"), "db: {password: hunter2}\n").unwrap();

        let provider = DefaultSecretsProvider::new(temp.path()).unwrap().with_env(no_env);
        let sources = sources(&yaml(
            "x-secrets: [{driver: file, file_path: a.yml}, {driver: file, file_path: b.yml}, {driver: file, file_path: missing.yml}]",
        ))
        .unwrap();
        let secrets = provider.resolve(&sources).await.unwrap();
        assert_eq!(secrets, yaml("{db: {user: app, password: hunter2}}"));
    }

    #[tokio::test]
    async fn test_vault_without_credentials() {
        let temp = TempDir::new().unwrap();
        let provider = DefaultSecretsProvider::new(temp.path()).unwrap().with_env(no_env);

        let optional = sources(&yaml(
            "x-secrets: [{driver: vault, vault_addr: 'http://127.0.0.1:1', secret_path: kv/app, auth: {ssh: {}}}]",
        ))
        .unwrap();
        assert_eq!(provider.resolve(&optional).await.unwrap(), yaml("{}"));

        let mandatory = sources(&yaml(
            "x-secrets: [{driver: vault, vault_addr: 'http://127.0.0.1:1', secret_path: kv/app, mandatory: true}]",
        ))
        .unwrap();
        let err = provider.resolve(&mandatory).await.unwrap_err();
        assert!(matches!(err, DsppError::RemoteAuthFailure { .. }));
    }
}
