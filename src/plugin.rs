use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::codec::{CodecError, MsgpackCodec};
use crate::config::{plugin_key, ConfigError, Registry, Value};

/// Interval used when a plugin asks for none
pub const DEFAULT_INTERVAL_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("roster stream error: {0}")]
    Codec(#[from] CodecError),
    #[error("roster registry error: {0}")]
    Config(#[from] ConfigError),
}

/// Declarative description of one collection plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub cluster: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    /// Executable path, relative to the plugin directory
    pub command: String,
    /// Seconds a single run may take
    #[serde(default)]
    pub max_duration: i64,
    /// Seconds between runs
    #[serde(default)]
    pub interval: i64,
    /// `KEY=VALUE` entries layered over the agent's environment
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Emit `_sys`/`_user`/`_total` cost metrics per run
    #[serde(default)]
    pub stats: bool,
}

impl PluginSpec {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
            group: String::new(),
            command: command.into(),
            max_duration: 0,
            interval: 0,
            env: Vec::new(),
            enabled: false,
            stats: false,
        }
    }

    /// Apply the interval/deadline rules: `interval > 0` (else 60) and
    /// `0 < max_duration <= interval` (else `interval`).
    pub fn normalized(mut self) -> Self {
        if self.interval <= 0 {
            self.interval = DEFAULT_INTERVAL_SECS;
        }
        if self.max_duration <= 0 || self.max_duration > self.interval {
            self.max_duration = self.interval;
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.max(1) as u64)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration.max(1) as u64)
    }

    /// Parsed environment; malformed entries are skipped
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => {
                    warn!(plugin = %self.name, entry = %entry, "ignoring malformed env entry");
                    None
                }
            })
            .collect()
    }

    /// Write every field under the cluster-scoped plugin keys
    pub fn store(&self, registry: &Registry) {
        let key = |field: &str| plugin_key(&self.cluster, field, &self.name);
        registry.batch_set(vec![
            (key("name"), Value::from(self.name.clone())),
            (key("group"), Value::from(self.group.clone())),
            (key("cmd"), Value::from(self.command.clone())),
            (key("maxTime"), Value::from(self.max_duration)),
            (key("interval"), Value::from(self.interval)),
            (key("env"), Value::from(self.env.clone())),
            (key("running"), Value::from(self.enabled)),
            (key("stats"), Value::from(self.stats)),
        ]);
    }

    /// Read a plugin back from the registry; `env` and `stats` are optional
    pub fn load(registry: &Registry, cluster: &str, name: &str) -> Result<Self, ConfigError> {
        let key = |field: &str| plugin_key(cluster, field, name);
        let spec = Self {
            cluster: cluster.to_string(),
            name: registry.get_str(&key("name"))?,
            group: registry.get_str(&key("group"))?,
            command: registry.get_str(&key("cmd"))?,
            max_duration: registry.get_int(&key("maxTime"))?,
            interval: registry.get_int(&key("interval"))?,
            env: optional(registry.get_list(&key("env")))?.unwrap_or_default(),
            enabled: registry.get_bool(&key("running"))?,
            stats: optional(registry.get_bool(&key("stats")))?.unwrap_or(false),
        };
        Ok(spec)
    }
}

fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, ConfigError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decode a stream of binary plugin records into the registry.
///
/// Each record is normalized before it is stored. Returns the number imported.
pub async fn import_roster<R>(reader: R, registry: &Registry) -> Result<usize, RosterError>
where
    R: AsyncRead + Unpin,
{
    let mut records = FramedRead::new(reader, MsgpackCodec::<PluginSpec>::new());
    let mut count = 0;
    while let Some(record) = records.next().await {
        let spec = record?.normalized();
        info!(
            cluster = %spec.cluster,
            plugin = %spec.name,
            enabled = spec.enabled,
            "importing plugin"
        );
        spec.store(registry);
        count += 1;
    }
    Ok(count)
}

/// Serialize every plugin registered for `cluster` as binary records
pub async fn export_roster<W>(cluster: &str, registry: &Registry, writer: W) -> Result<usize, RosterError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MsgpackCodec::<PluginSpec>::new());
    let mut count = 0;
    for name in registry.plugin_names(cluster) {
        let spec = PluginSpec::load(registry, cluster, &name)?;
        sink.send(spec).await?;
        count += 1;
    }
    sink.close().await?;
    Ok(count)
}
