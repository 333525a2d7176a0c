use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::errors::ConfigError;

pub const KAFKA_BROKERS: &str = "kafka_brokers";
pub const KAFKA_TOPICS: &str = "kafka_topics";
pub const KAFKA_CONSUMER_GROUP: &str = "kafka_consumer_group";
pub const KAFKA_COMPRESSION: &str = "kafka_compression";
pub const KAFKA_CONFIG: &str = "kafka_config";
pub const KAFKA_CONFIG_FILE: &str = "kafka_config_file";

/// Keys interpreted by the adapter's own consumer client. They are never
/// passed through to librdkafka.
pub const EVENTS_CHANNEL_ENABLE: &str = "events.channel.enable";
pub const EVENTS_CHANNEL_SIZE: &str = "events.channel.size";
pub const APPLICATION_REBALANCE_ENABLE: &str = "application.rebalance.enable";

const DEFAULT_SESSION_TIMEOUT_MS: i64 = 6000;
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Read access to externally supplied key/value configuration.
pub trait ConfigSource {
    fn is_set(&self, key: &str) -> bool;

    fn get_string(&self, key: &str) -> Option<String>;

    /// Lists may be given as a sequence or as a single string separated by
    /// whitespace or commas. Missing keys yield an empty list.
    fn get_string_list(&self, key: &str) -> Vec<String>;

    /// Returns `None` unless the value is a mapping.
    fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>>;
}

/// In-memory configuration source, populated directly, from YAML or from the
/// process environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: BTreeMap<String, serde_yaml::Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let values: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;
        Ok(Self { values })
    }

    /// Reads the conventional keys from upper-cased environment variables,
    /// e.g. `KAFKA_BROKERS` for `kafka_brokers`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        for key in [
            KAFKA_BROKERS,
            KAFKA_TOPICS,
            KAFKA_CONSUMER_GROUP,
            KAFKA_COMPRESSION,
            KAFKA_CONFIG,
            KAFKA_CONFIG_FILE,
        ] {
            if let Ok(value) = std::env::var(key.to_uppercase()) {
                settings.set(key, value);
            }
        }
        settings
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ConfigSource for Settings {
    fn is_set(&self, key: &str) -> bool {
        self.values
            .get(key)
            .is_some_and(|v| !matches!(v, serde_yaml::Value::Null))
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(serde_yaml::Value::Sequence(items)) => items
                .iter()
                .filter_map(scalar_to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            Some(value) => scalar_to_string(value)
                .map(|s| {
                    s.split(|c: char| c.is_whitespace() || c == ',')
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn get_string_map(&self, key: &str) -> Option<BTreeMap<String, String>> {
        match self.values.get(key) {
            Some(serde_yaml::Value::Mapping(mapping)) => Some(
                mapping
                    .iter()
                    .filter_map(|(k, v)| Some((scalar_to_string(k)?, scalar_to_string(v)?)))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// A single broker-client property. Defaults keep their native type while
/// free-form overrides arrive as strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl ConfigValue {
    /// Interprets the value as a flag, accepting string forms of booleans.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Str(s) => s.parse().ok(),
            ConfigValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Str(s) => s.parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }
}

/// Merged broker-client properties. Immutable once returned by [`build_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerConfig {
    entries: BTreeMap<String, ConfigValue>,
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.entries.iter()
    }

    fn overlay(&mut self, other: impl IntoIterator<Item = (String, ConfigValue)>) {
        self.entries.extend(other);
    }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for BrokerConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

impl Role {
    pub fn default_config(self) -> BrokerConfig {
        match self {
            Role::Source => SourceDefaults::default().to_config(),
            Role::Sink => SinkDefaults::default().to_config(),
        }
    }
}

/// Built-in consumer properties for the Source role.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDefaults {
    pub session_timeout_ms: i64,
    pub auto_offset_reset: String,
    pub queued_max_messages_kbytes: i64,
    pub events_channel_enable: bool,
    pub events_channel_size: i64,
    pub application_rebalance_enable: bool,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            auto_offset_reset: "earliest".to_string(),
            queued_max_messages_kbytes: 16384,
            events_channel_enable: true,
            events_channel_size: 100,
            application_rebalance_enable: true,
        }
    }
}

impl SourceDefaults {
    pub fn to_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::new();
        config
            .set("session.timeout.ms", self.session_timeout_ms)
            .set("auto.offset.reset", self.auto_offset_reset.as_str())
            .set("queued.max.messages.kbytes", self.queued_max_messages_kbytes)
            .set(EVENTS_CHANNEL_ENABLE, self.events_channel_enable)
            .set(EVENTS_CHANNEL_SIZE, self.events_channel_size)
            .set(APPLICATION_REBALANCE_ENABLE, self.application_rebalance_enable);
        config
    }
}

/// Built-in producer properties for the Sink role.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkDefaults {
    pub queued_max_messages_kbytes: i64,
}

impl Default for SinkDefaults {
    fn default() -> Self {
        Self {
            queued_max_messages_kbytes: 16384,
        }
    }
}

impl SinkDefaults {
    pub fn to_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::new();
        config.set("queued.max.messages.kbytes", self.queued_max_messages_kbytes);
        config
    }
}

/// Validates `source` for `role` and merges it over the role's built-in defaults.
pub fn build_config(source: &dyn ConfigSource, role: Role) -> Result<BrokerConfig, ConfigError> {
    build_config_with_defaults(source, role, role.default_config())
}

/// Precedence, lowest first: `defaults`, the `kafka_config_file` contents, the
/// free-form `kafka_config` pairs, then the named convenience fields.
pub fn build_config_with_defaults(
    source: &dyn ConfigSource,
    role: Role,
    defaults: BrokerConfig,
) -> Result<BrokerConfig, ConfigError> {
    let brokers = require_list(source, KAFKA_BROKERS)?;
    let group = match role {
        Role::Source => {
            require_list(source, KAFKA_TOPICS)?;
            Some(require_string(source, KAFKA_CONSUMER_GROUP)?)
        }
        Role::Sink => None,
    };

    let mut config = defaults;

    if source.is_set(KAFKA_CONFIG_FILE) {
        let path = source.get_string(KAFKA_CONFIG_FILE).unwrap_or_default();
        config.overlay(load_config_file(&path)?);
    }

    if let Some(pairs) = source.get_string_map(KAFKA_CONFIG) {
        config.overlay(pairs.into_iter().map(|(k, v)| (k, ConfigValue::Str(v))));
    } else if let Some(raw) = source.get_string(KAFKA_CONFIG) {
        config.overlay(
            parse_key_values(&raw)?
                .into_iter()
                .map(|(k, v)| (k, ConfigValue::Str(v))),
        );
    }

    config.set("bootstrap.servers", brokers.join(","));
    if let Some(group) = group {
        config.set("group.id", group);
    }
    if role == Role::Sink {
        if let Some(compression) = source.get_string(KAFKA_COMPRESSION) {
            config.set("compression.type", compression);
        }
    }

    Ok(config)
}

fn require_list(source: &dyn ConfigSource, key: &str) -> Result<Vec<String>, ConfigError> {
    let values = source.get_string_list(key);
    if values.is_empty() {
        return Err(ConfigError::MissingField {
            field: key.to_string(),
        });
    }
    Ok(values)
}

fn require_string(source: &dyn ConfigSource, key: &str) -> Result<String, ConfigError> {
    match source.get_string(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingField {
            field: key.to_string(),
        }),
    }
}

/// Parses whitespace separated `key=value` tokens, splitting each once on the
/// first `=`.
pub fn parse_key_values(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ConfigError::Invalid {
                message: format!("expected key=value, got '{token}'"),
            }),
        })
        .collect()
}

/// Loads a YAML (or JSON) mapping of scalar broker properties.
pub fn load_config_file(path: &str) -> Result<Vec<(String, ConfigValue)>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|error| ConfigError::FileLoad {
        path: path.to_string(),
        error,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::FileFormat {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::Bool(b) => ConfigValue::Bool(b),
                serde_yaml::Value::Number(n) => match n.as_i64() {
                    Some(i) => ConfigValue::Int(i),
                    None => ConfigValue::Str(n.to_string()),
                },
                serde_yaml::Value::String(s) => ConfigValue::Str(s),
                other => {
                    return Err(ConfigError::FileFormat {
                        path: path.to_string(),
                        reason: format!("value for '{key}' is not a scalar: {other:?}"),
                    });
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// Timing knobs for the source lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    /// Upper bound for each topic metadata lookup during ping.
    pub metadata_timeout: Duration,
    /// How long close waits for the consume loop to confirm it has exited.
    pub close_grace: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS as u64),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Everything needed to start a source: client properties, topics and timings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub client: BrokerConfig,
    pub topics: Vec<String>,
    pub settings: SourceSettings,
}

impl SourceConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let client = build_config(source, Role::Source)?;
        Ok(Self {
            client,
            topics: source.get_string_list(KAFKA_TOPICS),
            settings: SourceSettings::default(),
        })
    }
}
