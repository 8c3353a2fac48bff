//! Global configuration: JSON load/validate/default-fill.
//!
//! JSON is the sole config source — no environment variable overrides,
//! matching the teacher's "single source of truth" config philosophy
//! (`forwarder::config`), just with `serde_json` in place of `toml` since
//! the spec's wire format is JSON.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub brokers: String,
    pub default_topic: String,
    pub node_id: String,
    pub rdkafka_passthrough: Vec<(String, String)>,
    pub debug: bool,
    pub response_file: Option<String>,
    pub blacklist: Vec<String>,
    pub listeners: Vec<ListenerConfig>,
    pub mse_sensors: Vec<MseStreamConfig>,
    pub meraki_secrets: HashMap<String, Value>,
    pub zz_http2k: Option<ZzConfig>,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub proto: Proto,
    pub port: u16,
    pub mode: String,
    pub num_threads: u32,
    pub redborder_uri: bool,
    pub decode_as: DecodeAs,
    pub connection_memory_limit: u64,
    pub connection_limit: u32,
    pub connection_timeout_s: u64,
    pub per_ip_connection_limit: u32,
    pub enrichment: serde_json::Map<String, Value>,
    pub max_time_offset_s: i64,
    pub max_time_offset_warning_wait_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeAs {
    Dumb,
    Mse,
    Meraki,
    Zz,
}

#[derive(Debug, Clone)]
pub struct MseStreamConfig {
    pub stream: String,
    pub enrichment: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ZzConfig {
    pub sensors_uuids: Value,
    pub organizations_uuids: Value,
    pub topics: HashMap<String, (Option<String>, String)>,
    pub organizations_sync: OrganizationsSync,
}

#[derive(Debug, Clone)]
pub struct OrganizationsSync {
    pub topics: Vec<String>,
    pub interval_s: u64,
    pub put_url: Option<String>,
    pub clean_mod_s: u64,
    pub clean_offset_s: u64,
}

pub fn load_config_from_path(path: &Path) -> Result<GlobalConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&raw)
}

pub fn load_config_from_str(raw: &str) -> Result<GlobalConfig, ConfigError> {
    let doc: Value = serde_json::from_str(raw)?;
    parse_global_config(&doc)
}

fn required_str(doc: &Value, field: &str) -> Result<String, ConfigError> {
    doc.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ConfigError::MissingField(field.to_owned()))
}

fn parse_global_config(doc: &Value) -> Result<GlobalConfig, ConfigError> {
    let brokers = required_str(doc, "brokers")?;
    let default_topic = required_str(doc, "topic")?;
    let node_id = doc
        .get("n2kafka_id")
        .and_then(Value::as_str)
        .unwrap_or("gateway")
        .to_owned();

    let mut rdkafka_passthrough = Vec::new();
    if let Some(obj) = doc.as_object() {
        for (k, v) in obj {
            if k.starts_with("rdkafka.") {
                if let Some(s) = v.as_str() {
                    rdkafka_passthrough.push((k.clone(), s.to_owned()));
                }
            }
        }
    }

    let debug = doc.get("debug").and_then(Value::as_u64).unwrap_or(0) != 0;
    let response_file = doc
        .get("response")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let blacklist = doc
        .get("blacklist")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let listeners = doc
        .get("listeners")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(parse_listener).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let mse_sensors = doc
        .get("mse-sensors")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(parse_mse_stream).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let meraki_secrets = doc
        .get("meraki-secrets")
        .and_then(Value::as_object)
        .map(|o| o.clone().into_iter().collect())
        .unwrap_or_default();

    let zz_http2k = doc.get("zz_http2k_config").map(parse_zz_config).transpose()?;

    Ok(GlobalConfig {
        brokers,
        default_topic,
        node_id,
        rdkafka_passthrough,
        debug,
        response_file,
        blacklist,
        listeners,
        mse_sensors,
        meraki_secrets,
        zz_http2k,
    })
}

fn parse_listener(v: &Value) -> Result<ListenerConfig, ConfigError> {
    let proto = match v.get("proto").and_then(Value::as_str) {
        Some("tcp") => Proto::Tcp,
        Some("udp") => Proto::Udp,
        Some("http") => Proto::Http,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "listener.proto must be tcp|udp|http, got {other:?}"
            )));
        }
    };
    let port = v
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConfigError::MissingField("listeners[].port".to_owned()))?;
    if port > u64::from(u16::MAX) {
        return Err(ConfigError::InvalidValue("port out of range".to_owned()));
    }
    let decode_as = match v.get("decode_as").and_then(Value::as_str) {
        Some("MSE") => DecodeAs::Mse,
        Some("meraki") => DecodeAs::Meraki,
        Some("zz_http2k") => DecodeAs::Zz,
        Some("dumb") | None => DecodeAs::Dumb,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "unknown decode_as: {other}"
            )));
        }
    };
    let enrichment = v
        .get("enrichment")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Ok(ListenerConfig {
        proto,
        port: port as u16,
        mode: v
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("thread_per_connection")
            .to_owned(),
        num_threads: v.get("num_threads").and_then(Value::as_u64).unwrap_or(1) as u32,
        redborder_uri: v
            .get("redborder_uri")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        decode_as,
        connection_memory_limit: v
            .get("connection_memory_limit")
            .and_then(Value::as_u64)
            .unwrap_or(1 << 20),
        connection_limit: v
            .get("connection_limit")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        connection_timeout_s: v
            .get("connection_timeout")
            .and_then(Value::as_u64)
            .unwrap_or(60),
        per_ip_connection_limit: v
            .get("per_ip_connection_limit")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        enrichment,
        max_time_offset_s: v
            .get("max_time_offset")
            .and_then(Value::as_i64)
            .unwrap_or(3600),
        max_time_offset_warning_wait_s: v
            .get("max_time_offset_warning_wait")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

fn parse_mse_stream(v: &Value) -> Result<MseStreamConfig, ConfigError> {
    let stream = v
        .get("stream")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::MissingField("mse-sensors[].stream".to_owned()))?
        .to_owned();
    let enrichment = v
        .get("enrichment")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Ok(MseStreamConfig { stream, enrichment })
}

fn parse_zz_config(v: &Value) -> Result<ZzConfig, ConfigError> {
    let sensors_uuids = v.get("sensors_uuids").cloned().unwrap_or(Value::Null);
    let organizations_uuids = v.get("organizations_uuids").cloned().unwrap_or(Value::Null);

    let mut topics = HashMap::new();
    if let Some(obj) = v.get("topics").and_then(Value::as_object) {
        for (name, cfg) in obj {
            let partition_key = cfg
                .get("partition_key")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let algo = cfg
                .get("partition_algo")
                .and_then(Value::as_str)
                .unwrap_or("random")
                .to_owned();
            topics.insert(name.clone(), (partition_key, algo));
        }
    }

    let sync = v.get("organizations_sync");
    let organizations_sync = OrganizationsSync {
        topics: sync
            .and_then(|s| s.get("topics"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default(),
        interval_s: sync
            .and_then(|s| s.get("interval_s"))
            .and_then(Value::as_u64)
            .unwrap_or(60),
        put_url: sync
            .and_then(|s| s.get("put_url"))
            .and_then(Value::as_str)
            .map(str::to_owned),
        clean_mod_s: sync
            .and_then(|s| s.get("clean_on"))
            .and_then(|c| c.get("timestamp_s_mod"))
            .and_then(Value::as_u64)
            .unwrap_or(86400),
        clean_offset_s: sync
            .and_then(|s| s.get("clean_on"))
            .and_then(|c| c.get("timestamp_s_offset"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    };

    Ok(ZzConfig {
        sensors_uuids,
        organizations_uuids,
        topics,
        organizations_sync,
    })
}
