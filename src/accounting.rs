//! Accounting & organization-sync (spec.md §4.8): a report timer that
//! periodically publishes per-organization usage snapshots, a clean timer
//! that rolls counters and latches over on an absolute schedule, and the
//! limit-reached HTTP PUT callback fired on a quota latch transition.
//!
//! The original drives both timers from `SIGALRM`; this uses
//! `tokio::time::interval`/`sleep_until` tasks instead (an explicit
//! redesign, see DESIGN.md) — report cadence, clean-tick alignment, and
//! the latch-triggered PUT are all preserved exactly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::broker::{OutMessage, Publisher};
use crate::registry::Registry;

/// Fires `PUT <base_url>/<org_uuid>/reach_bytes_limit` with an empty body
/// when an organization's byte quota is first crossed. Fire-and-forget:
/// errors are logged, never retried (spec.md §4.8).
pub struct LimitCallback {
    client: reqwest::Client,
    base_url: String,
}

impl LimitCallback {
    pub fn new(base_url: String) -> Self {
        LimitCallback {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn fire(&self, org_uuid: &str) {
        let url = format!("{}/{}/reach_bytes_limit", self.base_url, org_uuid);
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.put(&url).send().await {
                tracing::warn!(error = %err, url, "accounting: limit-reached PUT failed");
            }
        });
    }
}

/// Owns the two periodic timers described in spec.md §4.8.
pub struct Accounting {
    registry: Arc<Registry>,
    publisher: Arc<dyn Publisher>,
    node_id: String,
    sync_topics: Vec<String>,
    interval_s: u64,
    clean_mod_s: u64,
    clean_offset_s: u64,
}

impl Accounting {
    pub fn new(
        registry: Arc<Registry>,
        publisher: Arc<dyn Publisher>,
        node_id: String,
        sync_topics: Vec<String>,
        interval_s: u64,
        clean_mod_s: u64,
        clean_offset_s: u64,
    ) -> Self {
        let clean_mod_s = clean_mod_s.max(1);
        Accounting {
            registry,
            publisher,
            node_id,
            sync_topics,
            interval_s: interval_s.max(1),
            clean_mod_s,
            // "clean_offset is normalized to clean_offset mod clean_mod if larger"
            clean_offset_s: clean_offset_s % clean_mod_s,
        }
    }

    /// Spawns the report and clean timers as independent background tasks.
    pub fn spawn(self: Arc<Self>) {
        let report = self.clone();
        tokio::spawn(async move { report.run_report_timer().await });
        let clean = self.clone();
        tokio::spawn(async move { clean.run_clean_timer().await });
    }

    async fn run_report_timer(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.report_tick().await;
        }
    }

    async fn run_clean_timer(&self) {
        loop {
            let delay = self.next_clean_delay(Utc::now().timestamp());
            tokio::time::sleep(Duration::from_secs(delay)).await;
            self.clean_tick();
        }
    }

    /// `(now - now mod clean_mod) + clean_offset + clean_mod` (spec.md
    /// §4.8's clean-timer schedule), returned as a delay from `now` rather
    /// than an absolute instant so the timer logic stays testable without
    /// wall-clock mocking.
    fn next_clean_delay(&self, now_epoch_s: i64) -> u64 {
        let now = now_epoch_s.max(0) as u64;
        let aligned = (now - now % self.clean_mod_s) + self.clean_offset_s + self.clean_mod_s;
        aligned.saturating_sub(now)
    }

    async fn report_tick(&self) {
        if self.sync_topics.is_empty() {
            return;
        }
        let now = Utc::now().timestamp();
        let snapshots: Vec<serde_json::Value> = self
            .registry
            .organizations()
            .iter()
            .map(|org| org.snapshot(now, &self.node_id, false))
            .collect();

        for topic in &self.sync_topics {
            for snapshot in &snapshots {
                let payload = match serde_json::to_vec(snapshot) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(error = %err, "accounting: failed to serialize snapshot");
                        continue;
                    }
                };
                let message = OutMessage {
                    topic: topic.clone(),
                    payload,
                    partition_key: None,
                    partition: None,
                };
                if let Err(err) = self.publisher.produce(message).await {
                    tracing::warn!(error = ?err, topic, "accounting: failed to publish usage snapshot");
                }
            }
        }
    }

    fn clean_tick(&self) {
        let now = Utc::now().timestamp();
        for org in self.registry.organizations() {
            org.snapshot(now, &self.node_id, true);
        }
    }
}
