use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const ENV_BASE_URL: &str = "WATCHPOST_BASE_URL";
const ENV_TOKEN: &str = "WATCHPOST_TOKEN";

/// Resolved client configuration. Credentials and base URL are carried
/// explicitly into the clients built from this; nothing reads them from
/// ambient global state.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub base_url: Url,
    pub auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ResolveConfigError {
    #[error("no base url: pass --base-url, set {ENV_BASE_URL}, or write a config file")]
    MissingBaseUrl,

    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

pub fn resolve_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("watchpost").join("config.json"))
}

/// Precedence: explicit flags, then environment, then the config file.
pub fn resolve_config(
    base_url_flag: Option<&str>,
    token_flag: Option<&str>,
) -> Result<MonitorConfig, ResolveConfigError> {
    let file = match resolve_config_path() {
        Some(path) if path.exists() => load_config_file(&path)?,
        _ => ConfigFile::default(),
    };
    resolve_config_from(base_url_flag, token_flag, file)
}

fn load_config_file(path: &Path) -> Result<ConfigFile, ResolveConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ResolveConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ResolveConfigError::ParseFile {
        path: path.display().to_string(),
        source,
    })
}

fn resolve_config_from(
    base_url_flag: Option<&str>,
    token_flag: Option<&str>,
    file: ConfigFile,
) -> Result<MonitorConfig, ResolveConfigError> {
    let raw_url = base_url_flag
        .map(ToOwned::to_owned)
        .or_else(|| std::env::var(ENV_BASE_URL).ok())
        .or(file.base_url)
        .ok_or(ResolveConfigError::MissingBaseUrl)?;

    let base_url = Url::parse(raw_url.trim()).map_err(|source| {
        ResolveConfigError::InvalidBaseUrl {
            url: raw_url.clone(),
            source,
        }
    })?;

    let auth_token = token_flag
        .map(ToOwned::to_owned)
        .or_else(|| std::env::var(ENV_TOKEN).ok())
        .or(file.auth_token)
        .filter(|token| !token.trim().is_empty());

    Ok(MonitorConfig {
        base_url,
        auth_token,
    })
}
