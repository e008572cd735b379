use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "repos-consumer.json";
pub const DEFAULT_KEY_SCHEMA: &str = "http://tardis.edu.au/schemas/reposproducer/key";
pub const DEFAULT_KEY_PARAMETER: &str = "key";
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub default_auth: Option<String>,
    #[serde(default)]
    pub default_auth_force_user_create: Option<bool>,
    #[serde(default)]
    pub key_schema: Option<String>,
    #[serde(default)]
    pub key_parameter: Option<String>,
    #[serde(default)]
    pub lock_scope: Option<LockScope>,
    #[serde(default)]
    pub lock_ttl_secs: Option<u64>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub force_http_urls: Option<bool>,
    #[serde(default)]
    pub placeholder_on_failure: Option<PlaceholderPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    Global,
    #[default]
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderPolicy {
    #[default]
    Keep,
    Delete,
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub source: Option<String>,
    pub storage_root: Utf8PathBuf,
    pub default_auth: Option<String>,
    pub force_user_create: bool,
    pub key_schema: String,
    pub key_parameter: String,
    pub lock_scope: LockScope,
    pub lock_ttl_secs: u64,
    pub http_timeout_secs: u64,
    pub force_http_urls: bool,
    pub placeholder_on_failure: PlaceholderPolicy,
}

impl HarvestConfig {
    pub fn with_storage_root(storage_root: Utf8PathBuf) -> Self {
        Self {
            source: None,
            storage_root,
            default_auth: None,
            force_user_create: false,
            key_schema: DEFAULT_KEY_SCHEMA.to_string(),
            key_parameter: DEFAULT_KEY_PARAMETER.to_string(),
            lock_scope: LockScope::default(),
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            force_http_urls: true,
            placeholder_on_failure: PlaceholderPolicy::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<HarvestConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<HarvestConfig, HarvestError> {
        let source = config
            .source
            .map(|value| normalize_source(&value))
            .transpose()?;

        let storage_root = match config.storage_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_storage_root()?,
        };

        let lock_ttl_secs = config.lock_ttl_secs.unwrap_or(DEFAULT_LOCK_TTL_SECS);
        if lock_ttl_secs == 0 {
            return Err(HarvestError::ConfigParse(
                "lock_ttl_secs must be positive".to_string(),
            ));
        }
        let http_timeout_secs = config
            .http_timeout_secs
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        if http_timeout_secs == 0 {
            return Err(HarvestError::ConfigParse(
                "http_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(HarvestConfig {
            source,
            storage_root,
            default_auth: config
                .default_auth
                .filter(|value| !value.trim().is_empty()),
            force_user_create: config.default_auth_force_user_create.unwrap_or(false),
            key_schema: config
                .key_schema
                .unwrap_or_else(|| DEFAULT_KEY_SCHEMA.to_string()),
            key_parameter: config
                .key_parameter
                .unwrap_or_else(|| DEFAULT_KEY_PARAMETER.to_string()),
            lock_scope: config.lock_scope.unwrap_or_default(),
            lock_ttl_secs,
            http_timeout_secs,
            force_http_urls: config.force_http_urls.unwrap_or(true),
            placeholder_on_failure: config.placeholder_on_failure.unwrap_or_default(),
        })
    }
}

pub fn normalize_source(value: &str) -> Result<String, HarvestError> {
    let trimmed = value.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|err| HarvestError::InvalidSource(format!("{value}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(HarvestError::InvalidSource(value.to_string()));
    }
    Ok(trimmed.to_string())
}

fn default_storage_root() -> Result<Utf8PathBuf, HarvestError> {
    ProjectDirs::from("", "", "repos-consumer")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok())
        .ok_or_else(|| HarvestError::Filesystem("unable to resolve data directory".to_string()))
}
