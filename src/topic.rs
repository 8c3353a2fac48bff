//! Topic registry: maps logical topic names to broker-topic handles.
//!
//! Handles are reference-counted (`Arc`); `swap` installs a new map under
//! an `ArcSwap` and drops the registry's own reference to the previous
//! generation. Sessions that are still holding a cloned `Arc<TopicHandle>`
//! keep that handle alive until they release it, even after a swap — this
//! falls directly out of `Arc` refcounting rather than needing an explicit
//! wait-for-zero-readers dance.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::RegistryError;

/// One logical topic: its broker-side name, an optional JSON-pointer-style
/// partition key extraction path, and the partitioner to use.
#[derive(Debug, Clone)]
pub struct TopicHandle {
    pub name: String,
    pub partition_key: Option<String>,
    pub partitioner_name: String,
}

pub struct TopicRegistry {
    topics: ArcSwap<HashMap<String, Arc<TopicHandle>>>,
    default_topic: String,
}

impl TopicRegistry {
    pub fn new(default_topic: String) -> Self {
        TopicRegistry {
            topics: ArcSwap::from_pointee(HashMap::new()),
            default_topic,
        }
    }

    /// Build from a `{name: {partition_key, partition_algo}}` config map,
    /// always ensuring the default topic exists (falling back to `random`
    /// partitioning if not explicitly configured).
    pub fn from_config(
        default_topic: String,
        configured: &HashMap<String, (Option<String>, String)>,
    ) -> Self {
        let registry = TopicRegistry::new(default_topic.clone());
        let mut map = HashMap::new();
        for (name, (partition_key, partitioner_name)) in configured {
            map.insert(
                name.clone(),
                Arc::new(TopicHandle {
                    name: name.clone(),
                    partition_key: partition_key.clone(),
                    partitioner_name: partitioner_name.clone(),
                }),
            );
        }
        map.entry(default_topic.clone()).or_insert_with(|| {
            Arc::new(TopicHandle {
                name: default_topic.clone(),
                partition_key: None,
                partitioner_name: "random".to_owned(),
            })
        });
        registry.topics.store(Arc::new(map));
        registry
    }

    pub fn default_topic_name(&self) -> &str {
        &self.default_topic
    }

    /// Look up a topic handle by name; borrows an `Arc` the caller may
    /// hold across the whole decode→produce window.
    pub fn lookup(&self, name: &str) -> Result<Arc<TopicHandle>, RegistryError> {
        self.topics
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTopic(name.to_owned()))
    }

    /// Atomically replace the whole topic map. Live `Arc<TopicHandle>`
    /// clones held by in-flight sessions are unaffected.
    pub fn swap(&self, new_topics: HashMap<String, Arc<TopicHandle>>) {
        self.topics.store(Arc::new(new_topics));
    }

    /// Rebuild from a freshly reloaded config map (built off-lock by
    /// `from_config`) and swap it in.
    pub fn reload(&self, configured: &HashMap<String, (Option<String>, String)>) {
        let rebuilt = TopicRegistry::from_config(self.default_topic.clone(), configured);
        self.swap(rebuilt.topics.load_full().as_ref().clone());
    }
}
