//! Meraki decoder: secret-keyed auth (with a `"*"` default-secret
//! fallback), per-observation flatten-and-enrich.
//!
//! Field mapping, the RSSI offset, and the lat/lng rounding are taken from
//! `original_source/tests/0002-meraki.c`'s `CHECKDATA` fixtures.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};

use crate::error::DecodeError;

use super::{ConnMeta, DecodedMessage, Decoder, DecoderSession};

#[derive(Debug, Clone, Default)]
pub struct MerakiState {
    pub topic: String,
    pub per_listener_enrichment: Map<String, Value>,
    pub secrets: std::collections::HashMap<String, Map<String, Value>>,
}

pub struct MerakiDecoder {
    state: ArcSwap<MerakiState>,
}

impl MerakiDecoder {
    pub fn new(state: MerakiState) -> Self {
        MerakiDecoder {
            state: ArcSwap::from_pointee(state),
        }
    }

    pub fn reload(&self, state: MerakiState) {
        self.state.store(Arc::new(state));
    }
}

impl Decoder for MerakiDecoder {
    fn new_session(&self, _meta: &ConnMeta) -> Result<Box<dyn DecoderSession>, DecodeError> {
        Ok(Box::new(MerakiSession {
            state: self.state.load_full(),
        }))
    }
}

struct MerakiSession {
    state: Arc<MerakiState>,
}

impl DecoderSession for MerakiSession {
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<Vec<DecodedMessage>, DecodeError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let top: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "meraki: malformed json, dropping batch");
                return Ok(Vec::new());
            }
        };

        let Some(secret) = top.get("secret").and_then(Value::as_str) else {
            tracing::warn!("meraki: missing secret field, dropping batch");
            return Ok(Vec::new());
        };
        let Some(secret_enrichment) = self
            .state
            .secrets
            .get(secret)
            .or_else(|| self.state.secrets.get("*"))
        else {
            tracing::debug!(secret, "meraki: unknown secret, dropping batch");
            return Ok(Vec::new());
        };

        let ap_mac = top
            .pointer("/data/apMac")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let observations = top
            .pointer("/data/observations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let messages = observations
            .iter()
            .map(|obs| self.flatten(&ap_mac, obs, secret_enrichment))
            .collect::<Vec<_>>();
        Ok(messages)
    }
}

impl MerakiSession {
    fn flatten(&self, ap_mac: &str, obs: &Value, secret_enrichment: &Map<String, Value>) -> DecodedMessage {
        let mut out = Map::new();
        out.insert("type".to_owned(), Value::String("meraki".to_owned()));
        out.insert("wireless_station".to_owned(), Value::String(ap_mac.to_owned()));
        out.insert("src".to_owned(), strip_leading_slash(obs.get("ipv4")));
        out.insert("client_os".to_owned(), obs.get("os").cloned().unwrap_or(Value::Null));
        out.insert(
            "client_mac_vendor".to_owned(),
            obs.get("manufacturer").cloned().unwrap_or(Value::Null),
        );
        out.insert(
            "client_mac".to_owned(),
            obs.get("clientMac").cloned().unwrap_or(Value::Null),
        );
        out.insert(
            "timestamp".to_owned(),
            obs.get("seenEpoch").cloned().unwrap_or(Value::Null),
        );
        out.insert("client_rssi_num".to_owned(), rssi_offset(obs.get("rssi")));
        out.insert("client_latlong".to_owned(), lat_long(obs.get("location")));
        out.insert(
            "wireless_id".to_owned(),
            obs.get("ssid").cloned().unwrap_or(Value::Null),
        );

        insert_missing(&mut out, &self.state.per_listener_enrichment);
        insert_missing(&mut out, secret_enrichment);

        DecodedMessage {
            topic: self.state.topic.clone(),
            payload: serde_json::to_vec(&Value::Object(out)).unwrap_or_default(),
            partition_key: None,
        }
    }
}

fn strip_leading_slash(ipv4: Option<&Value>) -> Value {
    match ipv4.and_then(Value::as_str) {
        Some(s) => Value::String(s.strip_prefix('/').unwrap_or(s).to_owned()),
        None => Value::Null,
    }
}

fn rssi_offset(rssi: Option<&Value>) -> Value {
    match rssi.and_then(Value::as_i64) {
        Some(r) => Value::from(r - 95),
        None => Value::Null,
    }
}

fn lat_long(location: Option<&Value>) -> Value {
    let lat = location.and_then(|l| l.get("lat")).and_then(Value::as_f64);
    let lng = location.and_then(|l| l.get("lng")).and_then(Value::as_f64);
    match (lat, lng) {
        (Some(lat), Some(lng)) => Value::String(format!("{lat:.5},{lng:.5}")),
        _ => Value::Null,
    }
}

fn insert_missing(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (k, v) in source {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MSG: &str = r#"{
        "version":"2.0","secret":"r3dB0rder","type":"DevicesSeen",
        "data":{"apMac":"55:55:55:55:55:55","apFloors":[],"apTags":[],
        "observations":[
            {"ipv4":"/10.1.3.38","location":{"lat":37.42205275787813,"lng":-122.20766382990405},
             "seenTime":"2015-05-19T07:30:34Z","ssid":"Trinity","os":"Apple iOS",
             "clientMac":"78:3a:84:11:22:33","seenEpoch":1432020634,"rssi":0,"ipv6":null,
             "manufacturer":"Apple"},
            {"ipv4":null,"location":{"lat":37.42200897584358,"lng":-122.20751219778322},
             "seenTime":"2015-05-19T07:30:30Z","ssid":null,"os":null,
             "clientMac":"80:56:f2:44:55:66","seenEpoch":1432020630,"rssi":13,"ipv6":null,
             "manufacturer":"Hon Hai/Foxconn"}
        ]}}"#;

    fn session(secrets: HashMap<String, Map<String, Value>>) -> MerakiSession {
        MerakiSession {
            state: Arc::new(MerakiState {
                topic: "meraki-topic".to_owned(),
                per_listener_enrichment: Map::new(),
                secrets,
            }),
        }
    }

    fn secret_map(json: Value) -> HashMap<String, Map<String, Value>> {
        json.as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_object().unwrap().clone()))
            .collect()
    }

    #[test]
    fn valid_secret_flattens_every_observation() {
        let secrets = secret_map(serde_json::json!({
            "r3dB0rder": { "sensor_name": "meraki1", "sensor_id": 2 }
        }));
        let mut sess = session(secrets);
        let out = sess.on_chunk(MSG.as_bytes()).unwrap();
        assert_eq!(out.len(), 2);
        let first: Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(first["type"], "meraki");
        assert_eq!(first["wireless_station"], "55:55:55:55:55:55");
        assert_eq!(first["src"], "10.1.3.38");
        assert_eq!(first["client_rssi_num"], -95);
        assert_eq!(first["client_latlong"], "37.42205,-122.20766");
        assert_eq!(first["wireless_id"], "Trinity");

        let second: Value = serde_json::from_slice(&out[1].payload).unwrap();
        assert_eq!(second["src"], Value::Null);
        assert_eq!(second["client_rssi_num"], -82);
    }

    #[test]
    fn unknown_secret_with_no_default_drops_batch() {
        let secrets = secret_map(serde_json::json!({ "other-secret": { "sensor_name": "x" } }));
        let mut sess = session(secrets);
        assert!(sess.on_chunk(MSG.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn default_secret_used_when_exact_match_missing() {
        let secrets = secret_map(serde_json::json!({
            "*": { "sensor_name": "default", "sensor_id": 3 }
        }));
        let mut sess = session(secrets);
        let out = sess.on_chunk(MSG.as_bytes()).unwrap();
        assert_eq!(out.len(), 2);
        let first: Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(first["sensor_name"], "default");
    }

    #[test]
    fn listener_enrichment_wins_over_secret_enrichment() {
        let secrets = secret_map(serde_json::json!({ "r3dB0rder": { "tag": "from-secret" } }));
        let mut state = MerakiState {
            topic: "t".to_owned(),
            per_listener_enrichment: Map::new(),
            secrets,
        };
        state.per_listener_enrichment.insert("tag".to_owned(), Value::String("from-listener".to_owned()));
        let mut sess = MerakiSession { state: Arc::new(state) };
        let out = sess.on_chunk(MSG.as_bytes()).unwrap();
        let first: Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(first["tag"], "from-listener");
    }

    #[test]
    fn empty_observations_emits_zero_messages() {
        const EMPTY: &str = r#"{"secret":"r3dB0rder","data":{"apMac":"55:55:55:55:55:55","observations":[]}}"#;
        let secrets = secret_map(serde_json::json!({ "r3dB0rder": {} }));
        let mut sess = session(secrets);
        assert!(sess.on_chunk(EMPTY.as_bytes()).unwrap().is_empty());
    }
}
