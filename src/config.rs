#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOADS_ROOT: &str = "downloads";
pub const DEFAULT_AUDIT_LOG_NAME: &str = "log.txt";
pub const DEFAULT_VIDPULL_PORT: u16 = 5000;
pub const DEFAULT_VIDPULL_HOST: &str = "127.0.0.1";

/// Resolved server configuration. Every key has a default, so a bare
/// checkout runs without any env file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub downloads_root: PathBuf,
    pub audit_log: PathBuf,
    pub honor_existing: bool,
    pub vidpull_port: u16,
    pub vidpull_host: String,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

/// Command-line overrides; these win over both the environment and the env
/// file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub audit_log: Option<PathBuf>,
    pub honor_existing: Option<bool>,
    pub vidpull_port: Option<u16>,
    pub vidpull_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let downloads_root = overrides
        .downloads_root
        .or_else(|| {
            lookup_value("VIDPULL_DOWNLOADS_ROOT", file_vars, &env_lookup).map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_ROOT));
    let audit_log = overrides
        .audit_log
        .or_else(|| lookup_value("VIDPULL_AUDIT_LOG", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| downloads_root.join(DEFAULT_AUDIT_LOG_NAME));
    let honor_existing = overrides
        .honor_existing
        .or_else(|| {
            lookup_value("VIDPULL_HONOR_EXISTING", file_vars, &env_lookup)
                .and_then(|value| parse_bool(&value))
        })
        .unwrap_or(true);
    let vidpull_port = overrides
        .vidpull_port
        .or_else(|| {
            lookup_value("VIDPULL_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_VIDPULL_PORT);
    let vidpull_host = overrides
        .vidpull_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("VIDPULL_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_VIDPULL_HOST.to_string());
    RuntimeConfig {
        downloads_root,
        audit_log,
        honor_existing,
        vidpull_port,
        vidpull_host,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
