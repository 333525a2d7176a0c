//! Consumption-side adapter that exposes a Kafka subscription as a
//! receive → process → ack/fail message source.

pub mod config;
pub mod errors;
pub mod source;
pub mod telemetry;

pub use config::{BrokerConfig, ConfigSource, ConfigValue, Role, Settings, SourceConfig, build_config};
pub use errors::{BridgeError, ConfigError, KafkaError, Result, SourceError};
pub use source::kafka::{KafkaSource, LifecycleState};
pub use source::{Event, Incoming, Message, Source};
