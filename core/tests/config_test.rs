use bridge_core::config::*;
use bridge_core::errors::*;

struct ConfigCase {
    name: &'static str,
    values: Vec<(&'static str, &'static str)>,
    expected: Option<BrokerConfig>,
}

fn settings_from(values: &[(&str, &str)]) -> Settings {
    let mut settings = Settings::new();
    for (key, value) in values {
        settings.set(*key, *value);
    }
    settings
}

fn expected(entries: Vec<(&str, ConfigValue)>) -> Option<BrokerConfig> {
    Some(entries.into_iter().collect())
}

fn run_cases(role: Role, cases: Vec<ConfigCase>) {
    for case in cases {
        let settings = settings_from(&case.values);
        let result = build_config(&settings, role);
        match case.expected {
            Some(expected) => assert_eq!(result.ok(), Some(expected), "{}", case.name),
            None => assert!(result.is_err(), "{}: expected an error", case.name),
        }
    }
}

#[test]
fn test_sink_config() {
    run_cases(
        Role::Sink,
        vec![
            ConfigCase {
                name: "basic test",
                values: vec![
                    (KAFKA_BROKERS, "0.0.0.0:9092"),
                    (KAFKA_COMPRESSION, "snappy"),
                    (KAFKA_CONFIG, "linger.ms=1000 receive.message.max.bytes=2000000"),
                ],
                expected: expected(vec![
                    ("bootstrap.servers", "0.0.0.0:9092".into()),
                    ("compression.type", "snappy".into()),
                    ("queued.max.messages.kbytes", ConfigValue::Int(16384)),
                    ("linger.ms", "1000".into()),
                    ("receive.message.max.bytes", "2000000".into()),
                ]),
            },
            ConfigCase {
                name: "missing brokers",
                values: vec![
                    (KAFKA_COMPRESSION, "snappy"),
                    (KAFKA_CONFIG, "linger.ms=1000 receive.message.max.bytes=2000000"),
                ],
                expected: None,
            },
            ConfigCase {
                name: "invalid config file",
                values: vec![
                    (KAFKA_BROKERS, "0.0.0.0:9092"),
                    (KAFKA_CONFIG_FILE, "/not/a/file/path.yaml"),
                ],
                expected: None,
            },
        ],
    );
}

#[test]
fn test_source_config() {
    run_cases(
        Role::Source,
        vec![
            ConfigCase {
                name: "basic test",
                values: vec![
                    (KAFKA_BROKERS, "0.0.0.0:9092"),
                    (KAFKA_CONSUMER_GROUP, "cg-123"),
                    (KAFKA_TOPICS, "topic.0"),
                    (KAFKA_CONFIG, "linger.ms=1000 receive.message.max.bytes=2000000"),
                ],
                expected: expected(vec![
                    ("bootstrap.servers", "0.0.0.0:9092".into()),
                    ("group.id", "cg-123".into()),
                    ("linger.ms", "1000".into()),
                    ("receive.message.max.bytes", "2000000".into()),
                    ("auto.offset.reset", "earliest".into()),
                    ("queued.max.messages.kbytes", ConfigValue::Int(16384)),
                    ("session.timeout.ms", ConfigValue::Int(6000)),
                    (EVENTS_CHANNEL_ENABLE, ConfigValue::Bool(true)),
                    (EVENTS_CHANNEL_SIZE, ConfigValue::Int(100)),
                    (APPLICATION_REBALANCE_ENABLE, ConfigValue::Bool(true)),
                ]),
            },
            ConfigCase {
                name: "missing required config",
                values: vec![
                    (KAFKA_COMPRESSION, "snappy"),
                    (KAFKA_CONFIG, "linger.ms=1000 receive.message.max.bytes=2000000"),
                ],
                expected: None,
            },
            ConfigCase {
                name: "invalid config file",
                values: vec![
                    (KAFKA_BROKERS, "0.0.0.0:9092"),
                    (KAFKA_CONSUMER_GROUP, "cg-123"),
                    (KAFKA_TOPICS, "topic.0"),
                    (KAFKA_CONFIG_FILE, "/not/a/file/path.yaml"),
                ],
                expected: None,
            },
        ],
    );
}

#[test]
fn test_source_config_carries_topics() {
    let settings = settings_from(&[
        (KAFKA_BROKERS, "broker-1:9092 broker-2:9092"),
        (KAFKA_CONSUMER_GROUP, "cg-123"),
        (KAFKA_TOPICS, "topic.0,topic.1"),
    ]);
    let config = SourceConfig::from_source(&settings).unwrap();

    assert_eq!(config.topics, vec!["topic.0", "topic.1"]);
    assert_eq!(
        config.client.get("bootstrap.servers"),
        Some(&ConfigValue::from("broker-1:9092,broker-2:9092"))
    );
}

#[test]
fn test_missing_field_is_not_retryable() {
    let err = build_config(&Settings::new(), Role::Sink).unwrap_err();
    assert!(matches!(&err, ConfigError::MissingField { field } if field == KAFKA_BROKERS));
    assert!(!BridgeError::from(err).is_retryable());
}
