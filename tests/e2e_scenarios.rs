//! End-to-end decode → dispatch → publish scenarios, one per spec.md §8's
//! six concrete seeds, run through the public decoder/dispatcher API
//! against an in-memory fake publisher instead of a real broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use ingest_gateway::broker::{OutMessage, Publisher};
use ingest_gateway::decoder::meraki::{MerakiDecoder, MerakiState};
use ingest_gateway::decoder::mse::{MseDecoder, MseState};
use ingest_gateway::decoder::zz::ZzDecoder;
use ingest_gateway::decoder::{ConnMeta, Decoder, DecoderSession};
use ingest_gateway::dispatch::Dispatcher;
use ingest_gateway::error::PublishErrorClass;
use ingest_gateway::partition::PartitionerRegistry;
use ingest_gateway::registry::Registry;
use ingest_gateway::topic::TopicRegistry;

#[derive(Default)]
struct FakePublisher {
    sent: Mutex<Vec<OutMessage>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn produce(&self, message: OutMessage) -> Result<(), PublishErrorClass> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

fn topics(default: &str) -> Arc<TopicRegistry> {
    Arc::new(TopicRegistry::from_config(default.to_owned(), &HashMap::new()))
}

fn meta() -> ConnMeta {
    ConnMeta::default()
}

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

#[tokio::test]
async fn scenario_1_mse_v10_single_matching_stream_listener_enrichment_overlap() {
    let mut stream_enrichment = HashMap::new();
    stream_enrichment.insert(
        "rb-assoc".to_owned(),
        obj(json!({ "sensor_name": "testing", "sensor_id": 255 })),
    );
    let decoder = MseDecoder::new(MseState {
        topic: "mse-out".to_owned(),
        per_listener_enrichment: obj(json!({ "sensor_name": "sensor_listener", "a": "b" })),
        stream_enrichment,
        max_time_offset_s: 300,
        max_time_offset_warning_wait_s: 3600,
    });
    let mut session = decoder.new_session(&meta()).unwrap();
    let body = json!({
        "notifications": [
            { "deviceId": "00:11:22:33:44:55", "subscriptionName": "rb-assoc",
              "timestamp": chrono::Utc::now().timestamp() }
        ]
    });
    let out = session.on_chunk(&serde_json::to_vec(&body).unwrap()).unwrap();
    assert_eq!(out.len(), 1);
    let parsed: Value = serde_json::from_slice(&out[0].payload).unwrap();
    let n = &parsed["notifications"][0];
    assert_eq!(n["sensor_name"], "sensor_listener", "listener enrichment wins over stream on collision");
    assert_eq!(n["sensor_id"], 255);
    assert_eq!(n["a"], "b");
}

#[tokio::test]
async fn scenario_2_mse_v10_default_stream_miss() {
    let mut stream_enrichment = HashMap::new();
    stream_enrichment.insert("rb-assoc".to_owned(), obj(json!({ "sensor_name": "exact" })));
    stream_enrichment.insert(
        "*".to_owned(),
        obj(json!({ "sensor_name": "default_stream", "sensor_id": 254 })),
    );
    let decoder = MseDecoder::new(MseState {
        topic: "mse-out".to_owned(),
        per_listener_enrichment: Map::new(),
        stream_enrichment,
        max_time_offset_s: 300,
        max_time_offset_warning_wait_s: 3600,
    });
    let mut session = decoder.new_session(&meta()).unwrap();
    let body = json!({
        "notifications": [
            { "deviceId": "00:11:22:33:44:55", "subscriptionName": "rb-assoc0",
              "timestamp": chrono::Utc::now().timestamp() }
        ]
    });
    let out = session.on_chunk(&serde_json::to_vec(&body).unwrap()).unwrap();
    assert_eq!(out.len(), 1);
    let parsed: Value = serde_json::from_slice(&out[0].payload).unwrap();
    let n = &parsed["notifications"][0];
    assert_eq!(n["sensor_name"], "default_stream");
    assert_eq!(n["sensor_id"], 254);
}

const MERAKI_BODY: &str = r#"{
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
         "manufacturer":"Hon Hai/Foxconn"},
        {"ipv4":"/10.1.3.40","location":{"lat":37.422,"lng":-122.2077},
         "seenTime":"2015-05-19T07:30:40Z","ssid":"Trinity","os":"Android",
         "clientMac":"aa:bb:cc:dd:ee:ff","seenEpoch":1432020640,"rssi":-7,"ipv6":null,
         "manufacturer":"Samsung"}
    ]}}"#;

#[tokio::test]
async fn scenario_3_meraki_three_observations_valid_secret() {
    let mut secrets = HashMap::new();
    secrets.insert("r3dB0rder".to_owned(), obj(json!({})));
    let decoder = MerakiDecoder::new(MerakiState {
        topic: "meraki-out".to_owned(),
        per_listener_enrichment: Map::new(),
        secrets,
    });
    let mut session = decoder.new_session(&meta()).unwrap();
    let out = session.on_chunk(MERAKI_BODY.as_bytes()).unwrap();
    assert_eq!(out.len(), 3);
    for message in &out {
        let parsed: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(parsed["type"], "meraki");
        assert_eq!(parsed["wireless_station"], "55:55:55:55:55:55");
    }
    let first: Value = serde_json::from_slice(&out[0].payload).unwrap();
    assert_eq!(first["client_rssi_num"], -95);
    assert_eq!(first["client_latlong"], "37.42205,-122.20766");
}

#[tokio::test]
async fn scenario_4_meraki_invalid_secret_emits_nothing() {
    let mut secrets = HashMap::new();
    secrets.insert("other-secret".to_owned(), obj(json!({})));
    let decoder = MerakiDecoder::new(MerakiState {
        topic: "meraki-out".to_owned(),
        per_listener_enrichment: Map::new(),
        secrets,
    });
    let mut session = decoder.new_session(&meta()).unwrap();
    let out = session.on_chunk(MERAKI_BODY.as_bytes()).unwrap();
    assert!(out.is_empty());
}

fn zz_setup(bytes_limit: Option<u64>) -> (Arc<Registry>, Arc<TopicRegistry>) {
    let sensors = json!({
        "s1": { "enrichment": { "a": 1, "b": "c" }, "organization_uuid": "o1" }
    });
    let orgs = match bytes_limit {
        Some(limit) => json!({ "o1": { "bytes_limit": limit } }),
        None => json!({ "o1": {} }),
    };
    let registry = Arc::new(Registry::parse(&sensors, &orgs).unwrap());
    (registry, topics("events"))
}

fn zz_meta() -> ConnMeta {
    ConnMeta {
        client_ip: "127.0.0.1".to_owned(),
        topic: Some("events".to_owned()),
        sensor_uuid: Some("s1".to_owned()),
    }
}

#[tokio::test]
async fn scenario_5_zz_enrichment_key_collision() {
    let (registry, topics) = zz_setup(None);
    let decoder = ZzDecoder::new(registry, topics, None);
    let mut session = decoder.new_session(&zz_meta()).unwrap();
    let out = session.on_chunk(br#"{"a":99,"x":"y"}"#).unwrap();
    assert_eq!(out.len(), 1);
    let parsed: Value = serde_json::from_slice(&out[0].payload).unwrap();
    assert_eq!(parsed["x"], "y");
    assert_eq!(parsed["a"], 1, "original a=99 suppressed, server enrichment wins");
    assert_eq!(parsed["b"], "c");
}

#[tokio::test]
async fn scenario_6_zz_quota_crossing_stops_emission_but_keeps_tallying() {
    let (registry, topics) = zz_setup(Some(1000));
    let decoder = ZzDecoder::new(registry.clone(), topics, None);
    let mut session = decoder.new_session(&zz_meta()).unwrap();

    let one_object = format!(r#"{{"pad":"{}"}}"#, "x".repeat(200));
    let mut total_emitted = 0usize;
    let mut fed = 0u64;
    for _ in 0..8 {
        fed += one_object.len() as u64;
        let out = session.on_chunk(one_object.as_bytes()).unwrap();
        total_emitted += out.len();
    }
    assert!(fed >= 1500, "should have fed at least 1500 bytes total");

    let org = registry.organization("o1").unwrap();
    assert!(org.limit_reached(), "quota should have latched");
    assert!(total_emitted < 8, "emission should have stopped once the quota was crossed");
    assert!(
        org.consumed_bytes() >= 1000,
        "consumed_bytes should have reached the quota threshold"
    );
}

#[tokio::test]
async fn dispatcher_forwards_decoded_zz_messages_to_the_publisher() {
    let (registry, topic_registry) = zz_setup(None);
    let decoder = ZzDecoder::new(registry, topic_registry.clone(), None);
    let mut session = decoder.new_session(&zz_meta()).unwrap();
    let decoded = session.on_chunk(br#"{"x":"y"}"#).unwrap();

    let publisher = Arc::new(FakePublisher::default());
    let dispatcher = Dispatcher::new(
        topic_registry,
        Arc::new(PartitionerRegistry::default()),
        publisher.clone(),
    );
    dispatcher.dispatch_all(decoded).await;

    let sent = publisher.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "events");
}
