//! MSE (Mobility Services Engine) decoder: batched location-notification
//! JSON, two wire schemas (`StreamingNotification` for v8, a top-level
//! `notifications` array for v10), per-stream enrichment with a `"*"`
//! default-stream fallback, and a timestamp guard.
//!
//! Schema/field names and the enrichment-ordering and emission-format rules
//! below are taken from `original_source/src/decoder/mse/rb_mse.c`: per-
//! listener enrichment is applied first (so it wins ties), then per-stream
//! enrichment, both as insert-if-absent merges — and both are skipped
//! entirely when the stream enrichment table is empty, even for
//! per-listener enrichment. A batch of exactly one notification is
//! re-serialized as the original top-level document (enriched in place); a
//! batch of more than one splits into one `{"notifications":[...]}` message
//! per device, keyed by its (MAC-validated) device id.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::warn_limit::WarnLimiter;

use super::{ConnMeta, DecodedMessage, Decoder, DecoderSession};

/// Reloadable MSE configuration: topic, per-listener enrichment, the
/// per-stream enrichment table (keyed by `subscriptionName`, with `"*"` as
/// the default-stream fallback), and the timestamp guard's allowed skew.
#[derive(Debug, Clone)]
pub struct MseState {
    pub topic: String,
    pub per_listener_enrichment: Map<String, Value>,
    pub stream_enrichment: std::collections::HashMap<String, Map<String, Value>>,
    pub max_time_offset_s: i64,
    pub max_time_offset_warning_wait_s: u64,
}

pub struct MseDecoder {
    state: ArcSwap<MseState>,
    timestamp_warn: ArcSwap<WarnLimiter>,
}

impl MseDecoder {
    pub fn new(state: MseState) -> Self {
        let warn = WarnLimiter::new(Duration::from_secs(state.max_time_offset_warning_wait_s));
        MseDecoder {
            state: ArcSwap::from_pointee(state),
            timestamp_warn: ArcSwap::from_pointee(warn),
        }
    }

    /// Build the new table off-lock, then swap it in atomically (spec.md
    /// §9's recommended reload fix, applied here as everywhere else). The
    /// warning table is rebuilt too, since `max_time_offset_warning_wait`
    /// is one of the "offset parameters" reload replaces.
    pub fn reload(&self, state: MseState) {
        let warn = WarnLimiter::new(Duration::from_secs(state.max_time_offset_warning_wait_s));
        self.timestamp_warn.store(Arc::new(warn));
        self.state.store(Arc::new(state));
    }
}

impl Decoder for MseDecoder {
    fn new_session(&self, _meta: &ConnMeta) -> Result<Box<dyn DecoderSession>, DecodeError> {
        Ok(Box::new(MseSession {
            state: self.state.load_full(),
            timestamp_warn: self.timestamp_warn.load_full(),
        }))
    }
}

struct MseSession {
    state: Arc<MseState>,
    timestamp_warn: Arc<WarnLimiter>,
}

impl MseSession {
    fn timestamp_warn(&self) -> &WarnLimiter {
        &self.timestamp_warn
    }
}

impl DecoderSession for MseSession {
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<Vec<DecodedMessage>, DecodeError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let top: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "mse: malformed json, dropping batch");
                return Ok(Vec::new());
            }
        };

        if top.get("StreamingNotification").is_some() {
            Ok(self.decode_v8(top))
        } else if top.get("notifications").is_some() {
            Ok(self.decode_v10(top))
        } else {
            tracing::warn!("mse: unrecognized schema, dropping batch");
            Ok(Vec::new())
        }
    }
}

impl MseSession {
    fn decode_v8(&self, mut top: Value) -> Vec<DecodedMessage> {
        let Some(notification) = top
            .get_mut("StreamingNotification")
            .and_then(Value::as_object_mut)
        else {
            return Vec::new();
        };

        let device_id = notification
            .get("deviceId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let subscription_name = notification
            .get("subscriptionName")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let timestamp_s = notification
            .get("timestampMillis")
            .and_then(Value::as_i64)
            .map(|ms| ms / 1000);

        if !self.enrich(notification, subscription_name.as_deref()) {
            return Vec::new();
        }
        self.guard_timestamp(subscription_name.as_deref(), timestamp_s);

        let partition_key = self.mac_partition_key(device_id.as_deref());
        let payload = serde_json::to_vec(&top).unwrap_or_default();
        vec![DecodedMessage {
            topic: self.state.topic.clone(),
            payload,
            partition_key,
        }]
    }

    fn decode_v10(&self, mut top: Value) -> Vec<DecodedMessage> {
        let Some(array) = top.get_mut("notifications").and_then(Value::as_array_mut) else {
            return Vec::new();
        };

        let mut keys = Vec::with_capacity(array.len());
        let mut keep = Vec::with_capacity(array.len());
        for item in array.iter_mut() {
            let Some(obj) = item.as_object_mut() else {
                keep.push(false);
                keys.push(None);
                continue;
            };
            let device_id = obj.get("deviceId").and_then(Value::as_str).map(str::to_owned);
            let subscription_name = obj
                .get("subscriptionName")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let timestamp_s = obj.get("timestamp").and_then(Value::as_i64);

            if !self.enrich(obj, subscription_name.as_deref()) {
                keep.push(false);
                keys.push(None);
                continue;
            }
            self.guard_timestamp(subscription_name.as_deref(), timestamp_s);

            keep.push(true);
            keys.push(self.mac_partition_key(device_id.as_deref()));
        }

        if !keep.iter().any(|k| *k) {
            return Vec::new();
        }

        let Some(array) = top.get_mut("notifications").and_then(Value::as_array_mut) else {
            return Vec::new();
        };
        let mut kept = keep.iter();
        array.retain(|_| *kept.next().unwrap());
        let keys: Vec<Option<Vec<u8>>> = keys
            .into_iter()
            .zip(keep)
            .filter_map(|(key, keep)| keep.then_some(key))
            .collect();

        if array.len() == 1 {
            let partition_key = keys.into_iter().next().flatten();
            let payload = serde_json::to_vec(&top).unwrap_or_default();
            return vec![DecodedMessage {
                topic: self.state.topic.clone(),
                payload,
                partition_key,
            }];
        }

        let Some(array) = top.get_mut("notifications").and_then(Value::as_array_mut) else {
            return Vec::new();
        };
        array
            .drain(..)
            .zip(keys)
            .map(|(item, partition_key)| {
                let wrapped = serde_json::json!({ "notifications": [item] });
                DecodedMessage {
                    topic: self.state.topic.clone(),
                    payload: serde_json::to_vec(&wrapped).unwrap_or_default(),
                    partition_key,
                }
            })
            .collect()
    }

    /// Insert-if-absent enrichment: per-listener fields first (so they win
    /// ties), then per-stream fields, looking up the stream table by
    /// `subscriptionName` with a `"*"` default-stream fallback. Both steps
    /// are skipped entirely when the stream table is empty — matching
    /// `rb_mse.c` exactly rather than "fixing" what looks like an asymmetry.
    ///
    /// Returns `false` when the stream table is nonempty and neither the
    /// name nor `"*"` resolves (including when `subscriptionName` is
    /// absent) — the caller must drop the notification in that case
    /// (`rb_mse.c:716-730`'s `memset(to,0,…); continue;`).
    fn enrich(&self, notification: &mut Map<String, Value>, subscription_name: Option<&str>) -> bool {
        if self.state.stream_enrichment.is_empty() {
            return true;
        }
        let Some(fields) = subscription_name
            .and_then(|name| self.state.stream_enrichment.get(name))
            .or_else(|| self.state.stream_enrichment.get("*"))
        else {
            return false;
        };

        insert_missing(notification, &self.state.per_listener_enrichment);
        insert_missing(notification, fields);
        true
    }

    fn guard_timestamp(&self, subscription_name: Option<&str>, timestamp_s: Option<i64>) {
        let Some(ts) = timestamp_s else { return };
        let now = chrono::Utc::now().timestamp();
        if (now - ts).abs() > self.state.max_time_offset_s {
            let class = subscription_name.unwrap_or("(unknown)");
            if self.timestamp_warn().fire(class) {
                tracing::warn!(
                    subscription = class,
                    notification_ts = ts,
                    now,
                    "mse: notification timestamp outside allowed skew"
                );
            }
        }
    }

    fn mac_partition_key(&self, device_id: Option<&str>) -> Option<Vec<u8>> {
        let id = device_id?;
        crate::partition::parse_mac(id)?;
        Some(id.as_bytes().to_vec())
    }
}

fn insert_missing(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (k, v) in source {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
