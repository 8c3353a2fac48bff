//! Sensor / organization registry.
//!
//! Read-mostly, hot-swappable under an `ArcSwap`. Sensor entries carry
//! static enrichment and an optional owning organization; organization
//! entries carry a byte quota, an atomically-updated consumed counter, and
//! a limit-reached latch. `lookup` clones `Arc`s (refcounted borrow across
//! the whole decode→produce window); `swap` installs a new generation and
//! drops the registry's own reference to the old one, not any references
//! still held by in-flight sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};

use crate::error::RegistryError;

#[derive(Debug, Clone)]
pub struct SensorEntry {
    pub uuid: String,
    pub enrichment: Arc<Map<String, Value>>,
    pub org_uuid: Option<String>,
}

#[derive(Debug)]
pub struct OrganizationEntry {
    pub uuid: String,
    pub byte_limit: Option<u64>,
    consumed: AtomicU64,
    limit_reached: AtomicBool,
}

impl OrganizationEntry {
    pub fn new(uuid: String, byte_limit: Option<u64>) -> Self {
        OrganizationEntry {
            uuid,
            byte_limit,
            consumed: AtomicU64::new(0),
            limit_reached: AtomicBool::new(false),
        }
    }

    pub fn consumed_bytes(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn limit_reached(&self) -> bool {
        self.limit_reached.load(Ordering::SeqCst)
    }

    /// Atomically add `n` bytes to the consumed counter. Returns `true`
    /// exactly when this call is the one that crosses the quota for the
    /// first time in the current interval (the caller should invoke the
    /// limit-reached callback in that case, and only that case).
    pub fn add_consumed(&self, n: u64) -> bool {
        let previous = self.consumed.fetch_add(n, Ordering::SeqCst);
        let new_total = previous + n;
        match self.byte_limit {
            Some(limit) if new_total >= limit => {
                !self.limit_reached.swap(true, Ordering::SeqCst)
            }
            _ => false,
        }
    }

    /// Produce one accounting snapshot message, optionally rolling the
    /// counter and latch over for the next interval.
    pub fn snapshot(&self, now_epoch_s: i64, node_id: &str, reset: bool) -> Value {
        let consumed = if reset {
            let v = self.consumed.swap(0, Ordering::SeqCst);
            self.limit_reached.store(false, Ordering::SeqCst);
            v
        } else {
            self.consumed_bytes()
        };
        serde_json::json!({
            "uuid": self.uuid,
            "consumed_bytes": consumed,
            "timestamp": now_epoch_s,
            "node_id": node_id,
        })
    }
}

#[derive(Default)]
struct RegistrySnapshot {
    sensors: HashMap<String, Arc<SensorEntry>>,
    organizations: HashMap<String, Arc<OrganizationEntry>>,
}

pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }
}

impl Registry {
    /// Parse a registry from the `{ "mse-sensors": ..., "zz_http2k_config":
    /// { "sensors_uuids": ..., "organizations_uuids": ... } }`-shaped JSON
    /// documented in spec.md §6, specifically the `sensors_uuids` /
    /// `organizations_uuids` maps. Builds the whole structure off-lock
    /// before it is ever installed, so there is no half-applied-map window
    /// (spec.md §9's recommended fix, applied uniformly).
    pub fn parse(sensors_uuids: &Value, organizations_uuids: &Value) -> Result<Self, RegistryError> {
        let mut organizations = HashMap::new();
        if let Some(orgs) = organizations_uuids.as_object() {
            for (uuid, cfg) in orgs {
                let byte_limit = cfg.get("bytes_limit").and_then(Value::as_u64);
                organizations.insert(
                    uuid.clone(),
                    Arc::new(OrganizationEntry::new(uuid.clone(), byte_limit)),
                );
            }
        }

        let mut sensors = HashMap::new();
        if let Some(sens) = sensors_uuids.as_object() {
            for (uuid, cfg) in sens {
                let enrichment = cfg
                    .get("enrichment")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let org_uuid = cfg
                    .get("organization_uuid")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                sensors.insert(
                    uuid.clone(),
                    Arc::new(SensorEntry {
                        uuid: uuid.clone(),
                        enrichment: Arc::new(enrichment),
                        org_uuid,
                    }),
                );
            }
        }

        Ok(Registry {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot {
                sensors,
                organizations,
            }),
        })
    }

    /// Look up a sensor (and, if present, its owning organization) by
    /// sensor UUID. Both are returned as `Arc`s the caller may hold for
    /// the whole session lifetime.
    pub fn lookup(
        &self,
        sensor_uuid: &str,
    ) -> Result<(Arc<SensorEntry>, Option<Arc<OrganizationEntry>>), RegistryError> {
        let snap = self.snapshot.load();
        let sensor = snap
            .sensors
            .get(sensor_uuid)
            .cloned()
            .ok_or(RegistryError::UnknownSensor)?;
        let org = sensor
            .org_uuid
            .as_ref()
            .and_then(|uuid| snap.organizations.get(uuid).cloned());
        Ok((sensor, org))
    }

    pub fn organization(&self, org_uuid: &str) -> Option<Arc<OrganizationEntry>> {
        self.snapshot.load().organizations.get(org_uuid).cloned()
    }

    pub fn organizations(&self) -> Vec<Arc<OrganizationEntry>> {
        self.snapshot.load().organizations.values().cloned().collect()
    }

    pub fn swap(&self, new_registry: Registry) {
        self.snapshot.store(new_registry.snapshot.load_full());
    }
}
