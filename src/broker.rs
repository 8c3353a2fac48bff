//! Thin wrapper around the broker client library.
//!
//! The broker client itself (here, `rdkafka`) is an out-of-scope external
//! collaborator per spec.md §1 — this module only names the interfaces the
//! core consumes: "produce a UTF-8 JSON payload to a topic, optionally with
//! a partition key, transferring ownership of the payload buffer."

use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::error::PublishErrorClass;

/// One message ready to be handed to the broker: a topic name, the
/// serialized JSON payload, an optional partition key, and an optional
/// already-resolved explicit partition index (set by the dispatch layer
/// when a custom partitioner — e.g. `mac` — picked one; `None` lets the
/// broker client choose, which is also what the `random` partitioner
/// means).
pub struct OutMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub partition_key: Option<Vec<u8>>,
    pub partition: Option<i32>,
}

/// What the decoders and the accounting subsystem need from a broker
/// client. `produce` takes ownership of the message; on success the
/// payload belongs to the broker client from that point on (it must not be
/// read again by the caller), matching the "F_FREE" transfer-of-ownership
/// contract in spec.md §9.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn produce(&self, message: OutMessage) -> Result<(), PublishErrorClass>;

    async fn produce_batch(&self, messages: Vec<OutMessage>) -> Vec<Result<(), PublishErrorClass>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.produce(message).await);
        }
        results
    }

    /// Number of partitions for `topic`, if knowable without blocking the
    /// caller unduly. `None` means "let the broker client's own default
    /// partitioning apply" — the dispatch layer skips explicit partitioner
    /// evaluation in that case.
    async fn partition_count(&self, _topic: &str) -> Option<i32> {
        None
    }
}

/// `rdkafka`-backed publisher.
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, passthrough: &[(String, String)]) -> Result<Self, KafkaError> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", brokers);
        for (key, value) in passthrough {
            if let Some(stripped) = key.strip_prefix("rdkafka.") {
                if !stripped.starts_with("topic.") {
                    config.set(stripped, value);
                }
            }
        }
        let producer: FutureProducer = config.create()?;
        Ok(KafkaPublisher { producer })
    }
}

#[async_trait::async_trait]
impl Publisher for KafkaPublisher {
    async fn produce(&self, message: OutMessage) -> Result<(), PublishErrorClass> {
        let mut record = FutureRecord::to(&message.topic).payload(&message.payload);
        if let Some(key) = message.partition_key.as_ref() {
            record = record.key(key);
        }
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }
        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok(_) => Ok(()),
            Err((KafkaError::MessageProduction(code), _)) => Err(classify(code)),
            Err((err, _)) => {
                tracing::warn!(error = %err, "broker produce failed");
                Err(PublishErrorClass::QueueFull)
            }
        }
    }

    async fn partition_count(&self, topic: &str) -> Option<i32> {
        let producer = self.producer.clone();
        let topic = topic.to_owned();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Duration::from_secs(5))
                .ok()
        })
        .await
        .ok()
        .flatten()
        .and_then(|metadata| metadata.topics().first().map(|t| t.partitions().len() as i32))
    }
}

fn classify(code: rdkafka::types::RDKafkaErrorCode) -> PublishErrorClass {
    use rdkafka::types::RDKafkaErrorCode as E;
    match code {
        E::QueueFull => PublishErrorClass::QueueFull,
        E::MessageSizeTooLarge => PublishErrorClass::MessageTooLarge,
        E::UnknownPartition => PublishErrorClass::UnknownPartition,
        E::UnknownTopic | E::UnknownTopicOrPartition => PublishErrorClass::UnknownTopic,
        _ => PublishErrorClass::QueueFull,
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// In-memory publisher for unit/integration tests: records every
    /// produced message instead of talking to a real broker.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub sent: Mutex<Vec<OutMessage>>,
        pub fail_next: Mutex<Option<PublishErrorClass>>,
    }

    #[async_trait::async_trait]
    impl Publisher for RecordingPublisher {
        async fn produce(&self, message: OutMessage) -> Result<(), PublishErrorClass> {
            if let Some(class) = self.fail_next.lock().unwrap().take() {
                return Err(class);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }
}
