//! ZZ streaming decoder: an unbounded concatenation of top-level JSON
//! objects over one connection, each rewritten with per-sensor enrichment
//! and counted against its organization's quota.
//!
//! `zz_http2k_parser.c`'s yajl pull parser tracks a `depth` counter and a
//! `skip_value` flag to suppress top-level keys that collide with the
//! sensor's enrichment object while passing nested content through
//! untouched. The low-level JSON tokenizer is an out-of-scope external
//! collaborator (spec.md §1), so this realizes the same depth-1-only
//! suppression using whole parsed `serde_json::Value`s instead of a
//! hand-rolled SAX parser: `serde_json::Deserializer::from_slice(..)
//! .into_iter::<Value>()` yields one complete top-level value per
//! iteration (its `byte_offset()` tells us how much of the buffer to
//! drop), and suppression is just "remove the top-level keys the
//! enrichment object also defines, then insert the enrichment object" —
//! the same end state as the original's streaming rewrite, since nested
//! structure is never touched either way.

use std::sync::Arc;

use serde_json::Value;

use crate::accounting::LimitCallback;
use crate::error::DecodeError;
use crate::registry::{OrganizationEntry, Registry, SensorEntry};
use crate::topic::{TopicHandle, TopicRegistry};

use super::{ConnMeta, DecodedMessage, Decoder, DecoderSession};

pub struct ZzDecoder {
    registry: Arc<Registry>,
    topics: Arc<TopicRegistry>,
    limit_callback: Option<Arc<LimitCallback>>,
}

impl ZzDecoder {
    pub fn new(
        registry: Arc<Registry>,
        topics: Arc<TopicRegistry>,
        limit_callback: Option<Arc<LimitCallback>>,
    ) -> Self {
        ZzDecoder {
            registry,
            topics,
            limit_callback,
        }
    }
}

impl Decoder for ZzDecoder {
    fn supports_streaming(&self) -> bool {
        true
    }

    fn new_session(&self, meta: &ConnMeta) -> Result<Box<dyn DecoderSession>, DecodeError> {
        let topic_name = meta
            .topic
            .as_deref()
            .ok_or_else(|| DecodeError::AuthzFailed("no topic in request".to_owned()))?;
        let topic = self
            .topics
            .lookup(topic_name)
            .map_err(|_| DecodeError::AuthzFailed(format!("unknown topic {topic_name}")))?;

        let sensor_uuid = meta
            .sensor_uuid
            .as_deref()
            .ok_or_else(|| DecodeError::AuthFailed("no sensor uuid in request".to_owned()))?;
        let (sensor, org) = self
            .registry
            .lookup(sensor_uuid)
            .map_err(|_| DecodeError::AuthFailed(format!("unknown sensor {sensor_uuid}")))?;

        Ok(Box::new(ZzSession {
            topic,
            sensor,
            org,
            buffer: Vec::new(),
            message_valid: true,
            limit_callback: self.limit_callback.clone(),
        }))
    }
}

struct ZzSession {
    topic: Arc<TopicHandle>,
    sensor: Arc<SensorEntry>,
    org: Option<Arc<OrganizationEntry>>,
    buffer: Vec<u8>,
    /// Latches to `false` permanently once this session's organization
    /// crosses its quota; incoming bytes are still tallied afterward
    /// (spec.md §4.7's accounting contract), but nothing more is parsed or
    /// emitted.
    message_valid: bool,
    limit_callback: Option<Arc<LimitCallback>>,
}

impl DecoderSession for ZzSession {
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<Vec<DecodedMessage>, DecodeError> {
        if bytes.is_empty() {
            return self.on_end();
        }

        if !self.message_valid {
            if let Some(org) = &self.org {
                org.add_consumed(bytes.len() as u64);
            }
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        let mut consumed = 0usize;

        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    if let Some(message) = self.process_value(value) {
                        messages.push(message);
                    }
                    if !self.message_valid {
                        break;
                    }
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "zz: parse error, aborting session");
                    return Err(DecodeError::MalformedPayload(err.to_string()));
                }
                None => break,
            }
        }
        let buffer_len = self.buffer.len();
        drop(stream);
        if self.message_valid {
            self.buffer.drain(..consumed);
        } else {
            // The quota just latched mid-buffer: the trailing bytes after
            // the crossing object were never parsed and never will be
            // (future chunks take the early-return tally-only path above),
            // so count them now or they'd vanish from the organization's
            // consumed total.
            let tail = buffer_len.saturating_sub(consumed);
            if tail > 0 {
                if let Some(org) = &self.org {
                    org.add_consumed(tail as u64);
                }
            }
            self.buffer.clear();
        }
        Ok(messages)
    }

    fn on_end(&mut self) -> Result<Vec<DecodedMessage>, DecodeError> {
        if self.buffer.iter().any(|b| !b.is_ascii_whitespace()) {
            tracing::warn!("zz: truncated trailing data at end of session, discarding");
        }
        self.buffer.clear();
        Ok(Vec::new())
    }
}

impl ZzSession {
    /// Suppress top-level keys the sensor's enrichment object also
    /// defines, insert the enrichment object's fields authoritatively,
    /// serialize, and count the result against the organization's quota.
    fn process_value(&mut self, mut value: Value) -> Option<DecodedMessage> {
        let Some(obj) = value.as_object_mut() else {
            tracing::warn!("zz: top-level value is not an object, dropping");
            return None;
        };

        for key in self.sensor.enrichment.keys() {
            obj.remove(key);
        }
        for (key, val) in self.sensor.enrichment.iter() {
            obj.insert(key.clone(), val.clone());
        }

        let partition_key = self
            .topic
            .partition_key
            .as_ref()
            .and_then(|field| obj.get(field))
            .and_then(Value::as_str)
            .map(|s| s.as_bytes().to_vec());

        let payload = serde_json::to_vec(&value).unwrap_or_default();
        if let Some(org) = &self.org {
            if org.add_consumed(payload.len() as u64) {
                self.message_valid = false;
                if let Some(callback) = &self.limit_callback {
                    callback.fire(&org.uuid);
                }
            }
        }

        Some(DecodedMessage {
            topic: self.topic.name.clone(),
            payload,
            partition_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::topic::TopicRegistry;
    use serde_json::json;
    use std::collections::HashMap;

    fn setup(bytes_limit: Option<u64>) -> (Arc<Registry>, Arc<TopicRegistry>) {
        let sensors = json!({ "s1": { "enrichment": { "a": 1, "b": "c" }, "organization_uuid": "o1" } });
        let orgs = match bytes_limit {
            Some(limit) => json!({ "o1": { "bytes_limit": limit } }),
            None => json!({ "o1": {} }),
        };
        let registry = Arc::new(Registry::parse(&sensors, &orgs).unwrap());
        let mut topics_cfg = HashMap::new();
        topics_cfg.insert("events".to_owned(), (Some("mac".to_owned()), "mac".to_owned()));
        let topics = Arc::new(TopicRegistry::from_config("events".to_owned(), &topics_cfg));
        (registry, topics)
    }

    fn meta() -> ConnMeta {
        ConnMeta {
            client_ip: "127.0.0.1".to_owned(),
            topic: Some("events".to_owned()),
            sensor_uuid: Some("s1".to_owned()),
        }
    }

    #[test]
    fn key_collision_suppressed_and_server_enrichment_wins() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let mut session = decoder.new_session(&meta()).unwrap();
        let out = session
            .on_chunk(br#"{"a":99,"x":"y"}"#)
            .unwrap();
        assert_eq!(out.len(), 1);
        let parsed: Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], "c");
        assert_eq!(parsed["x"], "y");
    }

    #[test]
    fn unknown_sensor_fails_session_creation() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let mut m = meta();
        m.sensor_uuid = Some("nope".to_owned());
        assert!(matches!(
            decoder.new_session(&m),
            Err(DecodeError::AuthFailed(_))
        ));
    }

    #[test]
    fn unknown_topic_fails_session_creation() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let mut m = meta();
        m.topic = Some("nope".to_owned());
        assert!(matches!(
            decoder.new_session(&m),
            Err(DecodeError::AuthzFailed(_))
        ));
    }

    #[test]
    fn parser_survives_chunk_boundary_split_mid_object() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let whole = br#"{"x":"y"}"#;
        for split in 0..=whole.len() {
            let (head, tail) = whole.split_at(split);
            let mut session = decoder.new_session(&meta()).unwrap();
            let mut out = session.on_chunk(head).unwrap();
            out.extend(session.on_chunk(tail).unwrap());
            assert_eq!(out.len(), 1, "split at {split} failed to emit exactly one message");
        }
    }

    #[test]
    fn quota_crossing_latches_and_still_tallies_bytes_after() {
        let (registry, topics) = setup(Some(5));
        let decoder = ZzDecoder::new(registry.clone(), topics, None);
        let mut session = decoder.new_session(&meta()).unwrap();
        let out = session.on_chunk(br#"{"x":"y"}"#).unwrap();
        assert_eq!(out.len(), 1, "the message that crosses the quota is still emitted");
        let org = registry.organization("o1").unwrap();
        assert!(org.limit_reached());
        let before = org.consumed_bytes();
        let out2 = session.on_chunk(br#"{"x":"y"}"#).unwrap();
        assert!(out2.is_empty(), "no further messages once latched");
        assert!(org.consumed_bytes() > before, "bytes still tallied after latch");
    }

    #[test]
    fn trailing_bytes_after_quota_crossing_are_tallied_not_dropped() {
        // Baseline: only the crossing object, no trailing bytes.
        let (registry_a, topics_a) = setup(Some(5));
        let decoder_a = ZzDecoder::new(registry_a.clone(), topics_a, None);
        let mut session_a = decoder_a.new_session(&meta()).unwrap();
        session_a.on_chunk(br#"{"x":"y"}"#).unwrap();
        let consumed_without_tail = registry_a.organization("o1").unwrap().consumed_bytes();

        // Same crossing object, plus a second (never-parsed) trailing object.
        let (registry_b, topics_b) = setup(Some(5));
        let decoder_b = ZzDecoder::new(registry_b.clone(), topics_b, None);
        let mut session_b = decoder_b.new_session(&meta()).unwrap();
        let out = session_b.on_chunk(br#"{"x":"y"}{"x":"z"}"#).unwrap();
        assert_eq!(out.len(), 1, "only the crossing object is emitted");
        let org_b = registry_b.organization("o1").unwrap();
        assert!(org_b.limit_reached());

        let tail_len = br#"{"x":"z"}"#.len() as u64;
        assert_eq!(
            org_b.consumed_bytes(),
            consumed_without_tail + tail_len,
            "unparsed trailing bytes in the crossing chunk must be tallied against the quota"
        );
    }

    #[test]
    fn multiple_top_level_objects_in_one_chunk_each_emit_separately() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let mut session = decoder.new_session(&meta()).unwrap();
        let out = session.on_chunk(br#"{"x":1}{"x":2}"#).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn partition_key_extracted_from_configured_field() {
        let (registry, topics) = setup(None);
        let decoder = ZzDecoder::new(registry, topics, None);
        let mut session = decoder.new_session(&meta()).unwrap();
        let out = session
            .on_chunk(br#"{"mac":"00:11:22:33:44:55"}"#)
            .unwrap();
        assert_eq!(
            out[0].partition_key.as_deref(),
            Some(b"00:11:22:33:44:55".as_slice())
        );
    }
}
