//! Glue between a decoder's output and the broker: topic lookup, explicit
//! partition resolution via the partitioner registry, and the rate-limited
//! per-error-class warnings spec.md §4.7/§7 require for transient broker
//! failures (queue-full, message-too-large, unknown-partition,
//! unknown-topic), minimum 5 minutes between warnings per class.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::{OutMessage, Publisher};
use crate::decoder::DecodedMessage;
use crate::error::PublishErrorClass;
use crate::partition::PartitionerRegistry;
use crate::topic::TopicRegistry;
use crate::warn_limit::WarnLimiter;

pub struct Dispatcher {
    topics: Arc<TopicRegistry>,
    partitioners: Arc<PartitionerRegistry>,
    publisher: Arc<dyn Publisher>,
    publish_warn: WarnLimiter,
}

impl Dispatcher {
    pub fn new(
        topics: Arc<TopicRegistry>,
        partitioners: Arc<PartitionerRegistry>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Dispatcher {
            topics,
            partitioners,
            publisher,
            publish_warn: WarnLimiter::new(Duration::from_secs(300)),
        }
    }

    pub async fn dispatch_all(&self, messages: Vec<DecodedMessage>) {
        for message in messages {
            let _ = self.dispatch_one(message).await;
        }
    }

    async fn dispatch_one(&self, message: DecodedMessage) -> Result<(), PublishErrorClass> {
        let handle = match self.topics.lookup(&message.topic) {
            Ok(handle) => handle,
            Err(_) => {
                self.warn_once("unknown-topic", &message.topic);
                return Err(PublishErrorClass::UnknownTopic);
            }
        };

        let partition_count = self.publisher.partition_count(&handle.name).await;
        let partition = match (partition_count, message.partition_key.as_deref()) {
            (Some(count), Some(key)) if count > 0 => {
                self.partitioners.evaluate(&handle.partitioner_name, key, count)
            }
            _ => None,
        };

        let out = OutMessage {
            topic: handle.name.clone(),
            payload: message.payload,
            partition_key: message.partition_key,
            partition,
        };

        match self.publisher.produce(out).await {
            Ok(()) => Ok(()),
            Err(class) => {
                self.warn_once(class_name(class), &handle.name);
                Err(class)
            }
        }
    }

    fn warn_once(&self, class: &str, topic: &str) {
        if self.publish_warn.fire(class) {
            tracing::warn!(class, topic, "dispatch: publish failed");
        }
    }
}

fn class_name(class: PublishErrorClass) -> &'static str {
    match class {
        PublishErrorClass::QueueFull => "queue-full",
        PublishErrorClass::MessageTooLarge => "message-too-large",
        PublishErrorClass::UnknownPartition => "unknown-partition",
        PublishErrorClass::UnknownTopic => "unknown-topic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_support::RecordingPublisher;
    use std::collections::HashMap;

    fn topics() -> Arc<TopicRegistry> {
        let mut cfg = HashMap::new();
        cfg.insert("events".to_owned(), (None, "random".to_owned()));
        Arc::new(TopicRegistry::from_config("events".to_owned(), &cfg))
    }

    #[tokio::test]
    async fn unknown_topic_is_dropped_with_rate_limited_warning() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(topics(), Arc::new(PartitionerRegistry::default()), publisher.clone());
        dispatcher
            .dispatch_all(vec![DecodedMessage {
                topic: "nope".to_owned(),
                payload: b"{}".to_vec(),
                partition_key: None,
            }])
            .await;
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_topic_is_forwarded_to_publisher() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(topics(), Arc::new(PartitionerRegistry::default()), publisher.clone());
        dispatcher
            .dispatch_all(vec![DecodedMessage {
                topic: "events".to_owned(),
                payload: b"{}".to_vec(),
                partition_key: None,
            }])
            .await;
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_rate_limited_per_class() {
        let publisher = Arc::new(RecordingPublisher::default());
        *publisher.fail_next.lock().unwrap() = Some(PublishErrorClass::QueueFull);
        let dispatcher = Dispatcher::new(topics(), Arc::new(PartitionerRegistry::default()), publisher.clone());
        let msg = || DecodedMessage {
            topic: "events".to_owned(),
            payload: b"{}".to_vec(),
            partition_key: None,
        };
        dispatcher.dispatch_all(vec![msg()]).await;
        *publisher.fail_next.lock().unwrap() = Some(PublishErrorClass::QueueFull);
        dispatcher.dispatch_all(vec![msg()]).await;
        // Both attempts fail; the second publish still goes through to the
        // publisher (fail_next is consumed), only the warning is throttled.
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }
}
