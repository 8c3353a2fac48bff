//! Partitioner registry and the MAC-address partitioner.
//!
//! A partitioner maps `(key bytes, partition count) -> partition index`.
//! Two are built in: `random` (delegates to the broker client's own
//! default partitioning) and `mac` (parses a colon-hex MAC address into a
//! 48-bit integer and reduces it modulo the partition count).

use std::collections::HashMap;

use crate::warn_limit::WarnLimiter;

/// A partitioner function. `None` means "let the broker client choose"
/// (the `random` partitioner).
pub type PartitionFn = fn(key: &[u8], partition_count: i32) -> Option<i32>;

/// Parse a `HH:HH:HH:HH:HH:HH` MAC address string into a 48-bit integer.
///
/// Returns `None` on any grammar violation: wrong length, missing colons,
/// or non-hex groups.
pub fn parse_mac(s: &str) -> Option<u64> {
    if s.len() != 17 {
        return None;
    }
    let mut value: u64 = 0;
    for (i, group) in s.split(':').enumerate() {
        if i >= 6 {
            return None;
        }
        if group.len() != 2 {
            return None;
        }
        let byte = u8::from_str_radix(group, 16).ok()?;
        value = (value << 8) | u64::from(byte);
    }
    // split(':') over a 17-byte string with 6 two-hex-digit groups must
    // produce exactly 6 groups; anything else (extra/missing colons) is
    // caught by inconsistent length accounting above in practice, but
    // guard explicitly since split() is lenient about empty groups.
    if s.matches(':').count() != 5 {
        return None;
    }
    Some(value)
}

/// `mac` partitioner: `int(mac) % partition_count`. Falls back to `None`
/// (random) on any parse failure — the caller is expected to log a
/// rate-limited warning when that happens.
pub fn mac_partitioner(key: &[u8], partition_count: i32) -> Option<i32> {
    if partition_count <= 0 {
        return None;
    }
    let s = std::str::from_utf8(key).ok()?;
    let mac = parse_mac(s)?;
    Some((mac % u64::from(partition_count as u32)) as i32)
}

/// `random` partitioner: always defers to the broker client's default.
pub fn random_partitioner(_key: &[u8], _partition_count: i32) -> Option<i32> {
    None
}

/// Registry of partitioner functions by name, plus the shared rate-limited
/// warning used when `mac` falls back to `random`.
pub struct PartitionerRegistry {
    functions: HashMap<&'static str, PartitionFn>,
    mac_fallback_warn: WarnLimiter,
}

impl Default for PartitionerRegistry {
    fn default() -> Self {
        let mut functions: HashMap<&'static str, PartitionFn> = HashMap::new();
        functions.insert("random", random_partitioner as PartitionFn);
        functions.insert("mac", mac_partitioner as PartitionFn);
        PartitionerRegistry {
            functions,
            mac_fallback_warn: WarnLimiter::new(std::time::Duration::from_secs(300)),
        }
    }
}

impl PartitionerRegistry {
    pub fn get(&self, name: &str) -> Option<PartitionFn> {
        self.functions.get(name).copied()
    }

    /// Evaluate the named partitioner, logging a rate-limited warning and
    /// falling back to `random` when `mac` fails to parse its key.
    pub fn evaluate(&self, name: &str, key: &[u8], partition_count: i32) -> Option<i32> {
        let f = self.get(name).unwrap_or(random_partitioner as PartitionFn);
        match f(key, partition_count) {
            Some(p) => Some(p),
            None if name == "mac" => {
                if self.mac_fallback_warn.fire("mac-partition-fallback") {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(key),
                        "mac partitioner could not parse key, falling back to random"
                    );
                }
                None
            }
            None => None,
        }
    }
}
