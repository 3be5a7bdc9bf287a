//! Kafka transactional producer sessions (rdkafka).
//!
//! Compiled only with the `kafka` feature. The transactional id is the relay's
//! [`ProducerIdentity`](tuyau_core::ProducerIdentity); `init_transactions` on
//! every open fences any older producer still holding the same id.

mod session;

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::ClientConfig;

use tuyau_core::ProducerIdentity;

pub use session::{KafkaProducerFactory, KafkaSession};

/// Producer settings shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,
    /// Broker-side bound on an open transaction.
    pub transaction_timeout: Duration,
    /// Bound on blocking control calls (init, commit, abort).
    pub operation_timeout: Duration,
    /// Bound on waiting for a produced record to be acknowledged.
    pub delivery_timeout: Duration,
    /// Extra rdkafka properties (pass-through, applied last).
    pub properties: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            transaction_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(30),
            properties: BTreeMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Self::default()
        }
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// rdkafka config for a transactional producer bound to `identity`.
    pub fn to_client_config(&self, identity: &ProducerIdentity) -> ClientConfig {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("transactional.id", identity.as_str())
            .set(
                "transaction.timeout.ms",
                self.transaction_timeout.as_millis().to_string(),
            )
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                self.delivery_timeout.as_millis().to_string(),
            );

        for (key, value) in &self.properties {
            config.set(key, value);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_is_transactional_for_the_identity() {
        let cfg = KafkaConfig::new("k1:9092,k2:9092")
            .with_transaction_timeout(Duration::from_secs(15))
            .with_property("client.id", "tuyau");

        let rdk = cfg.to_client_config(&ProducerIdentity::new("relay-7").unwrap());

        assert_eq!(rdk.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(rdk.get("transactional.id"), Some("relay-7"));
        assert_eq!(rdk.get("transaction.timeout.ms"), Some("15000"));
        assert_eq!(rdk.get("enable.idempotence"), Some("true"));
        assert_eq!(rdk.get("client.id"), Some("tuyau"));
    }

    #[test]
    fn properties_override_defaults() {
        let cfg = KafkaConfig::default().with_property("acks", "-1");
        let rdk = cfg.to_client_config(&ProducerIdentity::new("r").unwrap());

        assert_eq!(rdk.get("acks"), Some("-1"));
    }
}
