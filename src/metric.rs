use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Errors from building or encoding a single metric record.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("not enough fields: expected name;group;time;value[;source], got {0}")]
    MissingFields(usize),
    #[error("invalid value {value:?}: {source}")]
    InvalidValue {
        value: String,
        source: std::num::ParseFloatError,
    },
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary encode error: {0}")]
    Binary(#[from] rmp_serde::encode::Error),
}

/// A single measurement flowing through the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub group: String,
    /// Nanoseconds since the Unix epoch
    #[serde(default = "now_nanos", deserialize_with = "lenient_time")]
    pub time: i64,
    pub value: f64,
    /// Originating host; empty until a hop fills it in
    #[serde(default)]
    pub source: String,
}

/// Current wall-clock time in nanoseconds since the epoch
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl Metric {
    /// Build a metric; a missing time defaults to now
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        source: impl Into<String>,
        time: Option<i64>,
        value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            time: time.unwrap_or_else(now_nanos),
            value,
            source: source.into(),
        }
    }

    /// Fill `source` with `peer` unless the payload already carried one
    pub fn with_default_source(mut self, peer: &str) -> Self {
        if self.source.is_empty() {
            self.source = peer.to_string();
        }
        self
    }

    /// Parse one `name;group;time;value[;source]` line.
    ///
    /// A bad `time` silently becomes now; a bad `value` rejects the line.
    pub fn from_line(line: &str) -> Result<Self, MetricError> {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(MetricError::MissingFields(fields.len()));
        }

        let value = fields[3]
            .parse::<f64>()
            .map_err(|source| MetricError::InvalidValue {
                value: fields[3].to_string(),
                source,
            })?;

        Ok(Self {
            name: fields[0].to_string(),
            group: fields[1].to_string(),
            time: parse_time(fields[2]).unwrap_or_else(now_nanos),
            value,
            source: fields.get(4).map(|s| s.to_string()).unwrap_or_default(),
        })
    }

    /// Render as a newline-terminated text line
    pub fn to_line(&self) -> String {
        if self.source.is_empty() {
            format!("{};{};{};{}\n", self.name, self.group, self.time, self.value)
        } else {
            format!(
                "{};{};{};{};{}\n",
                self.name, self.group, self.time, self.value, self.source
            )
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, MetricError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Self-describing binary record (MessagePack map), the outbound wire form
    pub fn to_binary(&self) -> Result<Vec<u8>, MetricError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

/// Decimal or `0x`-prefixed integer. Octal and binary prefixes are not
/// accepted, so a zero-padded decimal stays decimal.
fn parse_time(raw: &str) -> Option<i64> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Accepts integers, integral floats and numeric strings; anything else is now.
fn lenient_time<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct TimeVisitor;

    impl<'de> Visitor<'de> for TimeVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a timestamp in nanoseconds")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            Ok(i64::try_from(v).unwrap_or_else(|_| now_nanos()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
            if v.is_finite() {
                Ok(v as i64)
            } else {
                Ok(now_nanos())
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
            Ok(parse_time(v.trim()).unwrap_or_else(now_nanos))
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> Result<i64, E> {
            Ok(now_nanos())
        }

        fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<i64, E> {
            Ok(now_nanos())
        }

        fn visit_unit<E: de::Error>(self) -> Result<i64, E> {
            Ok(now_nanos())
        }

        fn visit_none<E: de::Error>(self) -> Result<i64, E> {
            Ok(now_nanos())
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<i64, D::Error> {
            d.deserialize_any(TimeVisitor)
        }
    }

    deserializer.deserialize_any(TimeVisitor)
}
