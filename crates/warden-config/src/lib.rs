use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub upstream: Upstream,
    pub demo: Demo,
    pub auth: Auth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub base_url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demo {
    pub enabled: bool,
    #[serde(default = "default_reset_interval_hours")]
    pub reset_interval_hours: i64,
    #[serde(default = "default_simulated_message")]
    pub simulated_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub mode: String,
    #[serde(default)]
    pub verify_endpoint: Option<String>,
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,
    /// Username to bearer token, consulted in builtin mode only.
    #[serde(default)]
    pub static_tokens: BTreeMap<String, String>,
}

fn default_upstream_timeout_ms() -> u64 {
    10_000
}

fn default_reset_interval_hours() -> i64 {
    24
}

fn default_simulated_message() -> String {
    "Demo mode: this action was simulated and did not change the server.".to_string()
}

fn default_auth_timeout_ms() -> u64 {
    3_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.auth.mode != "builtin" && cfg.auth.mode != "remote" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "auth.mode={} is not implemented; supported: builtin, remote",
            cfg.auth.mode
        )));
    }
    if cfg.auth.mode == "remote"
        && cfg
            .auth
            .verify_endpoint
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "auth.verify_endpoint is required when auth.mode=remote".to_string(),
        ));
    }
    if cfg.auth.mode == "remote" && !cfg.auth.static_tokens.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "auth.static_tokens is not supported when auth.mode=remote".to_string(),
        ));
    }
    if cfg.auth.mode == "builtin" && cfg.auth.verify_endpoint.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "auth.verify_endpoint is not supported when auth.mode=builtin".to_string(),
        ));
    }
    if cfg.auth.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "auth.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.upstream.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "upstream.timeout_ms must be >= 1".to_string(),
        ));
    }
    if !(1..=8760).contains(&cfg.demo.reset_interval_hours) {
        return Err(ConfigError::UnsupportedConfig(
            "demo.reset_interval_hours must be between 1 and 8760".to_string(),
        ));
    }
    if cfg.demo.simulated_message.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "demo.simulated_message must not be empty".to_string(),
        ));
    }
    Ok(())
}
