//! Configuration loader and validator for the Graph heartbeat.
//!
//! Settings come from an optional YAML file and are then overridden by
//! environment variables (`.env` is loaded by the binary before this runs).
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::WorkflowVariant;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";
pub const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Missing configuration: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Which permissions the device-code grant asks for.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Named delegated permissions for every call the heartbeat makes.
    #[default]
    Delegated,
    /// `https://graph.microsoft.com/.default`.
    #[serde(rename = "default")]
    #[value(name = "default")]
    GraphDefault,
}

/// Whose drive the heartbeat reads and writes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// `/me/drive`
    #[default]
    Me,
    /// `/users/{upn}/drive`
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub tenant_id: String,
    pub client_id: String,
    pub target_upn: String,
    pub webhook_url: Option<String>,
    pub scope: ScopeMode,
    pub target: TargetMode,
    pub variant: WorkflowVariant,
    pub authority_host: String,
    pub graph_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            target_upn: String::new(),
            webhook_url: None,
            scope: ScopeMode::default(),
            target: TargetMode::default(),
            variant: WorkflowVariant::default(),
            authority_host: DEFAULT_AUTHORITY_HOST.into(),
            graph_base: DEFAULT_GRAPH_BASE.into(),
        }
    }
}

impl Config {
    /// Identity provider base, always ending in `/` so tenant paths join under it.
    pub fn authority_url(&self) -> Result<Url, ConfigError> {
        parse_base_url(&self.authority_host, "authority_host must be an absolute URL")
    }

    /// Graph base, always ending in `/` so resource paths join under it.
    pub fn graph_base_url(&self) -> Result<Url, ConfigError> {
        parse_base_url(&self.graph_base, "graph_base must be an absolute URL")
    }

    /// Webhook endpoint, `None` when unset or blank.
    pub fn webhook(&self) -> Result<Option<Url>, ConfigError> {
        match self.webhook_url.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|_| ConfigError::Invalid("webhook_url must be an absolute URL")),
        }
    }
}

/// Load configuration from an optional YAML file plus the process environment.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let content = match path {
        Some(p) => Some(fs::read_to_string(p)?),
        None => None,
    };
    from_sources(content.as_deref(), |key| std::env::var(key).ok())
}

/// Build a validated configuration from YAML text and a variable lookup.
pub fn from_sources<F>(yaml: Option<&str>, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg: Config = match yaml {
        Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text)?,
        _ => Config::default(),
    };
    apply_env(&mut cfg, lookup)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_env<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("TENANT_ID") {
        cfg.tenant_id = v;
    }
    if let Some(v) = lookup("CLIENT_ID") {
        cfg.client_id = v;
    }
    if let Some(v) = lookup("TARGET_UPN") {
        cfg.target_upn = v;
    }
    if let Some(v) = lookup("TEAMS_WEBHOOK_URL") {
        cfg.webhook_url = Some(v);
    }
    if let Some(v) = lookup("HEARTBEAT_SCOPE") {
        cfg.scope = parse_choice(&v, "HEARTBEAT_SCOPE must be `delegated` or `default`")?;
    }
    if let Some(v) = lookup("HEARTBEAT_TARGET") {
        cfg.target = parse_choice(&v, "HEARTBEAT_TARGET must be `me` or `user`")?;
    }
    if let Some(v) = lookup("HEARTBEAT_VARIANT") {
        cfg.variant = parse_choice(&v, "HEARTBEAT_VARIANT must be `full` or `storage_only`")?;
    }
    Ok(())
}

fn parse_choice<T: clap::ValueEnum>(raw: &str, msg: &'static str) -> Result<T, ConfigError> {
    T::from_str(raw.trim(), true).map_err(|_| ConfigError::Invalid(msg))
}

fn parse_base_url(raw: &str, msg: &'static str) -> Result<Url, ConfigError> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|_| ConfigError::Invalid(msg))
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.tenant_id.trim().is_empty() {
        return Err(ConfigError::Missing("TENANT_ID (tenant_id) must be set"));
    }
    if cfg.client_id.trim().is_empty() {
        return Err(ConfigError::Missing("CLIENT_ID (client_id) must be set"));
    }
    if cfg.target_upn.trim().is_empty() {
        return Err(ConfigError::Missing("TARGET_UPN (target_upn) must be set"));
    }
    cfg.authority_url()?;
    cfg.graph_base_url()?;
    cfg.webhook()?;
    Ok(())
}

/// Example YAML config.
pub fn example() -> &'static str {
    r#"tenant_id: "00000000-0000-0000-0000-000000000000"
client_id: "11111111-1111-1111-1111-111111111111"
target_upn: "admin@contoso.onmicrosoft.com"
webhook_url: "https://contoso.webhook.office.com/webhookb2/heartbeat"
scope: delegated
target: me
variant: full
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = from_sources(Some(example()), no_env).unwrap();
        assert_eq!(cfg.target_upn, "admin@contoso.onmicrosoft.com");
        assert_eq!(cfg.scope, ScopeMode::Delegated);
        assert_eq!(cfg.target, TargetMode::Me);
        assert_eq!(cfg.variant, WorkflowVariant::Full);
        assert_eq!(cfg.graph_base_url().unwrap().as_str(), DEFAULT_GRAPH_BASE);
        assert!(cfg.webhook().unwrap().is_some());
    }

    #[test]
    fn env_only_config() {
        let cfg = from_sources(
            None,
            env_of(&[
                ("TENANT_ID", "tenant"),
                ("CLIENT_ID", "client"),
                ("TARGET_UPN", "me@contoso.com"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.tenant_id, "tenant");
        assert_eq!(cfg.webhook().unwrap(), None);
        assert_eq!(cfg.authority_url().unwrap().as_str(), DEFAULT_AUTHORITY_HOST);
    }

    #[test]
    fn env_overrides_file() {
        let cfg = from_sources(
            Some(example()),
            env_of(&[
                ("TARGET_UPN", "other@contoso.com"),
                ("HEARTBEAT_SCOPE", "default"),
                ("HEARTBEAT_TARGET", "user"),
                ("HEARTBEAT_VARIANT", "storage_only"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.target_upn, "other@contoso.com");
        assert_eq!(cfg.scope, ScopeMode::GraphDefault);
        assert_eq!(cfg.target, TargetMode::User);
        assert_eq!(cfg.variant, WorkflowVariant::StorageOnly);
    }

    #[test]
    fn missing_required_values() {
        let err = from_sources(None, env_of(&[("CLIENT_ID", "c"), ("TARGET_UPN", "u")]))
            .unwrap_err();
        match err {
            ConfigError::Missing(msg) => assert!(msg.contains("TENANT_ID")),
            _ => panic!("wrong error"),
        }

        let err = from_sources(None, env_of(&[("TENANT_ID", "t"), ("CLIENT_ID", "c")]))
            .unwrap_err();
        match err {
            ConfigError::Missing(msg) => assert!(msg.contains("TARGET_UPN")),
            _ => panic!("wrong error"),
        }

        let err = from_sources(
            None,
            env_of(&[("TENANT_ID", "t"), ("CLIENT_ID", " "), ("TARGET_UPN", "u")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn blank_webhook_means_disabled() {
        let cfg = from_sources(Some(example()), env_of(&[("TEAMS_WEBHOOK_URL", "")])).unwrap();
        assert_eq!(cfg.webhook().unwrap(), None);
    }

    #[test]
    fn invalid_values_rejected() {
        let err = from_sources(Some(example()), env_of(&[("HEARTBEAT_SCOPE", "everything")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = from_sources(Some(example()), env_of(&[("TEAMS_WEBHOOK_URL", "not a url")]))
            .unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("webhook_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn base_urls_gain_trailing_slash() {
        let yaml = format!(
            "{}graph_base: \"http://127.0.0.1:8080/v1.0\"\n",
            example()
        );
        let cfg = from_sources(Some(&yaml), no_env).unwrap();
        assert_eq!(
            cfg.graph_base_url().unwrap().as_str(),
            "http://127.0.0.1:8080/v1.0/"
        );
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("heartbeat.yaml");
        fs::write(&p, example()).unwrap();
        let content = fs::read_to_string(&p).unwrap();
        let cfg = from_sources(Some(&content), no_env).unwrap();
        assert_eq!(cfg.client_id, "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("absent.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
