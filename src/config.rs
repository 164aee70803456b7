use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::codec::WireCodec;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key {key} holds {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Agent startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Outbound relay targets
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Inbound listener ports
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Persistence sink (store modes only)
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub dir: DirConfig,

    #[serde(default)]
    pub time: TimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: ClusterMode,
}

/// Where drained metrics go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterMode {
    /// Relay to upstream servers
    #[default]
    Normal,
    /// Relay and persist
    Store,
    /// Persist only; no outbound senders
    StoreOnly,
}

impl ClusterMode {
    pub fn forwards(&self) -> bool {
        !matches!(self, Self::StoreOnly)
    }

    pub fn persists(&self) -> bool {
        matches!(self, Self::Store | Self::StoreOnly)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_mailbox_size")]
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Comma-separated host:port list
    #[serde(default)]
    pub servers: String,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listener_host")]
    pub host: String,
    #[serde(default = "default_text_port")]
    pub text: i64,
    #[serde(default = "default_json_port")]
    pub json: i64,
    #[serde(default = "default_gob_port")]
    pub gob: i64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Comma-separated document endpoints
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirConfig {
    #[serde(default = "default_plugin_dir")]
    pub plugin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Reconciliation period in seconds
    #[serde(default = "default_check_secs")]
    pub check: i64,
}

fn default_mailbox_size() -> i64 {
    1024
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_listener_host() -> String {
    "0.0.0.0".to_string()
}

fn default_text_port() -> i64 {
    3900
}

fn default_json_port() -> i64 {
    3800
}

fn default_gob_port() -> i64 {
    3700
}

fn default_max_connections() -> usize {
    1024
}

fn default_plugin_dir() -> String {
    "plugin".to_string()
}

fn default_check_secs() -> i64 {
    30
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            size: default_mailbox_size(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_listener_host(),
            text: default_text_port(),
            json: default_json_port(),
            gob: default_gob_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin_dir(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            check: default_check_secs(),
        }
    }
}

/// Split a comma-separated list, dropping blanks
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl MailboxConfig {
    pub fn capacity(&self) -> usize {
        self.size.max(1) as usize
    }
}

impl UpstreamConfig {
    pub fn server_list(&self) -> Vec<String> {
        split_list(&self.servers)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl ListenerConfig {
    /// Configured port for a codec; out-of-range values fall back to the default
    pub fn port(&self, codec: WireCodec) -> u16 {
        let (raw, default) = match codec {
            WireCodec::Text => (self.text, default_text_port()),
            WireCodec::Json => (self.json, default_json_port()),
            WireCodec::Binary => (self.gob, default_gob_port()),
        };
        u16::try_from(raw)
            .ok()
            .filter(|p| *p >= 1)
            .unwrap_or(default as u16)
    }

    pub fn addr(&self, codec: WireCodec) -> String {
        format!("{}:{}", self.host, self.port(codec))
    }
}

impl ElasticsearchConfig {
    pub fn urls(&self) -> Vec<String> {
        split_list(&self.url)
    }
}

impl DirConfig {
    /// Resolve a plugin command against the plugin directory
    pub fn command_path(&self, command: &str) -> PathBuf {
        Path::new(&self.plugin).join(command)
    }
}

impl TimeConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(if self.check < 1 {
            default_check_secs() as u64
        } else {
            self.check as u64
        })
    }
}

impl AgentConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(cluster = %config.cluster.name, mode = ?config.cluster.mode, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Minimal configuration for a cluster, everything else defaulted
    pub fn for_cluster(name: impl Into<String>, mode: ClusterMode) -> Self {
        Self {
            cluster: ClusterConfig {
                name: name.into(),
                mode,
            },
            mailbox: MailboxConfig::default(),
            upstream: UpstreamConfig::default(),
            listener: ListenerConfig::default(),
            elasticsearch: ElasticsearchConfig::default(),
            dir: DirConfig::default(),
            time: TimeConfig::default(),
        }
    }

    /// Bootstrap checks; any failure must stop the agent from starting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.name is required".into()));
        }
        if self.cluster.mode == ClusterMode::Normal && self.upstream.server_list().is_empty() {
            return Err(ConfigError::Invalid(
                "normal mode requires upstream.servers".into(),
            ));
        }
        if self.cluster.mode.persists() && self.elasticsearch.urls().is_empty() {
            return Err(ConfigError::Invalid(
                "store modes require elasticsearch.url".into(),
            ));
        }
        Ok(())
    }
}

/// A typed registry value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Registry key for one plugin field: `<cluster>::plugin.<field>.<name>`
pub fn plugin_key(cluster: &str, field: &str, name: &str) -> String {
    format!("{}::plugin.{}.{}", cluster, field, name)
}

/// Shared key/value store holding the plugin roster.
///
/// Many readers, one writer (roster import). Accessors are typed and report
/// a missing key or a mistyped value as distinct errors.
#[derive(Debug, Default)]
pub struct Registry {
    data: RwLock<HashMap<String, Value>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.write().unwrap().insert(key.into(), value.into());
    }

    /// Write several keys under one lock so readers never see half a plugin
    pub fn batch_set(&self, entries: Vec<(String, Value)>) {
        let mut data = self.data.write().unwrap();
        for (key, value) in entries {
            data.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.data.write().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn lookup(&self, key: &str) -> Result<Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &'static str, found: &Value) -> ConfigError {
        ConfigError::WrongType {
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<String, ConfigError> {
        match self.lookup(key)? {
            Value::Str(s) => Ok(s),
            other => Err(Self::wrong_type(key, "string", &other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        match self.lookup(key)? {
            Value::Int(i) => Ok(i),
            other => Err(Self::wrong_type(key, "int", &other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.lookup(key)? {
            Value::Bool(b) => Ok(b),
            other => Err(Self::wrong_type(key, "bool", &other)),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.lookup(key)? {
            Value::List(l) => Ok(l),
            other => Err(Self::wrong_type(key, "list", &other)),
        }
    }

    /// Names of every plugin registered for `cluster`, sorted
    pub fn plugin_names(&self, cluster: &str) -> Vec<String> {
        let prefix = format!("{}::plugin.name.", cluster);
        self.keys_with_prefix(&prefix)
            .iter()
            .filter_map(|key| self.get_str(key).ok())
            .collect()
    }
}
