use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use encore_core::fingerprint::network_segment;
use encore_core::security_events::Severity;
use serde::Serialize;

use super::counter_store::CounterStore;

pub const VIOLATION_RETENTION_SECS: i64 = 3_600;
/// More than this many violations in the hour counts toward a challenge.
pub const VIOLATION_HISTORY_THRESHOLD: u64 = 3;
pub const VIOLATION_WARNING_THRESHOLD: u64 = 5;
pub const VIOLATION_CRITICAL_THRESHOLD: u64 = 10;
pub const AUTH_FAILURE_THRESHOLD: u64 = 3;
pub const VELOCITY_THRESHOLD_PER_MINUTE: u64 = 100;
pub const HIGH_RISK_ENDPOINT_THRESHOLD_PER_HOUR: u64 = 5;
pub const SEGMENT_THRESHOLD_5M: u64 = 50;
/// Distinct addresses a segment needs before its traffic counts as
/// distributed. One busy host is a velocity question, not a subnet one.
pub const SEGMENT_MIN_ADDRESSES: u64 = 5;

const VELOCITY_WINDOW_SECS: i64 = 60;
const SEGMENT_WINDOW_SECS: i64 = 300;
const MAX_RECORDS_PER_ADDRESS: usize = 64;
const MAX_ENDPOINT_KEY_LEN: usize = 128;

/// Counter key layout. Bucketed keys embed the bucket index so a counter
/// naturally rolls over when the bucket changes.
pub mod keys {
    use std::net::IpAddr;

    use chrono::{DateTime, Utc};

    pub fn hour_bucket(now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(3_600)
    }

    pub fn composite_violations(composite_key: &str) -> String {
        format!("violations:key:{composite_key}")
    }

    pub fn address_violations(addr: IpAddr, now: DateTime<Utc>) -> String {
        format!("violations:ip:{addr}:{}", hour_bucket(now))
    }

    pub fn endpoint_violations(endpoint: &str, now: DateTime<Utc>) -> String {
        format!("violations:endpoint:{endpoint}:{}", hour_bucket(now))
    }

    pub fn global_violations(now: DateTime<Utc>) -> String {
        format!("violations:global:{}", hour_bucket(now))
    }

    pub fn auth_failures(addr: IpAddr) -> String {
        format!("authfail:{addr}")
    }

    pub fn velocity(addr: IpAddr, now: DateTime<Utc>) -> String {
        format!("velocity:{addr}:{}", now.timestamp().div_euclid(60))
    }

    pub fn endpoint_hits(addr: IpAddr, endpoint: &str, now: DateTime<Utc>) -> String {
        format!("endpoint_hits:{addr}:{endpoint}:{}", hour_bucket(now))
    }

    fn segment_bucket(now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(300)
    }

    pub fn segment_requests(segment: &str, now: DateTime<Utc>) -> String {
        format!("segment:{segment}:{}", segment_bucket(now))
    }

    pub fn segment_member(segment: &str, addr: IpAddr, now: DateTime<Utc>) -> String {
        format!("segment_member:{segment}:{addr}:{}", segment_bucket(now))
    }

    pub fn segment_addresses(segment: &str, now: DateTime<Utc>) -> String {
        format!("segment_addrs:{segment}:{}", segment_bucket(now))
    }

    pub fn segment_alerts(segment: &str, now: DateTime<Utc>) -> String {
        format!("segment_alert:{segment}:{}", segment_bucket(now))
    }

    pub fn signature_sightings(composite_key: &str, now: DateTime<Utc>) -> String {
        format!("sightings:{composite_key}:{}", hour_bucket(now))
    }
}

/// One detected rate-limit breach.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ViolationRecord {
    pub partition_key: String,
    pub client_addr: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_signature: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Counter values right after a violation was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViolationTally {
    pub key_count: u64,
    pub address_count: u64,
    pub endpoint_count: u64,
    pub global_count: u64,
}

impl ViolationTally {
    pub fn severity(&self) -> Severity {
        if self.address_count >= VIOLATION_CRITICAL_THRESHOLD {
            Severity::Critical
        } else if self.address_count >= VIOLATION_WARNING_THRESHOLD {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

/// Per-request counters bumped for every non-exempt request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTally {
    pub velocity_per_minute: u64,
    pub segment_requests_5m: u64,
    pub segment_addresses_5m: u64,
    pub high_risk_endpoint_hits: Option<u64>,
}

impl RequestTally {
    pub fn velocity_exceeded(&self) -> bool {
        self.velocity_per_minute > VELOCITY_THRESHOLD_PER_MINUTE
    }

    pub fn distributed_attack(&self) -> bool {
        self.segment_requests_5m > SEGMENT_THRESHOLD_5M
            && self.segment_addresses_5m >= SEGMENT_MIN_ADDRESSES
    }

    pub fn high_risk_endpoint_exceeded(&self) -> bool {
        self.high_risk_endpoint_hits
            .is_some_and(|hits| hits > HIGH_RISK_ENDPOINT_THRESHOLD_PER_HOUR)
    }
}

/// Historical standing of a client address within the retention window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ClientStanding {
    pub violations: u64,
    pub auth_failures: u64,
}

impl ClientStanding {
    pub fn violation_history_exceeded(&self) -> bool {
        self.violations > VIOLATION_HISTORY_THRESHOLD
    }

    pub fn auth_failures_exceeded(&self) -> bool {
        self.auth_failures >= AUTH_FAILURE_THRESHOLD
    }
}

/// Time-windowed abuse counters over an injected [`CounterStore`].
///
/// Store failures are logged and read as zero: counting is advisory and must
/// never block the request pipeline.
pub struct ViolationLedger {
    store: Arc<dyn CounterStore>,
    records: DashMap<IpAddr, Vec<ViolationRecord>>,
}

impl ViolationLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            records: DashMap::new(),
        }
    }

    pub fn record_violation(
        &self,
        composite_key: &str,
        client_addr: IpAddr,
        endpoint: &str,
        client_signature: Option<&str>,
        identity: Option<&str>,
        now: DateTime<Utc>,
    ) -> ViolationTally {
        let endpoint = normalize_endpoint(endpoint);
        let retention = Duration::seconds(VIOLATION_RETENTION_SECS);

        let tally = ViolationTally {
            key_count: self.bump(&keys::composite_violations(composite_key), retention, now),
            address_count: self.bump(&keys::address_violations(client_addr, now), retention, now),
            endpoint_count: self.bump(&keys::endpoint_violations(&endpoint, now), retention, now),
            global_count: self.bump(&keys::global_violations(now), retention, now),
        };

        let record = ViolationRecord {
            partition_key: composite_key.to_string(),
            client_addr: client_addr.to_string(),
            endpoint,
            client_signature: client_signature.map(str::to_string),
            timestamp: now,
            identity: identity.map(str::to_string),
        };
        let mut records = self.records.entry(client_addr).or_default();
        records.retain(|existing| is_retained(existing, now));
        if records.len() >= MAX_RECORDS_PER_ADDRESS {
            records.remove(0);
        }
        records.push(record);

        tally
    }

    /// Raw counter lookup; zero when absent, expired or unreadable.
    pub fn query_violation_count(&self, key: &str, now: DateTime<Utc>) -> u64 {
        self.read(key, now)
    }

    pub fn address_violation_count(&self, client_addr: IpAddr, now: DateTime<Utc>) -> u64 {
        self.query_violation_count(&keys::address_violations(client_addr, now), now)
    }

    /// Called for failed logins, either observed from responses or reported
    /// directly by the identity subsystem.
    pub fn record_auth_failure(&self, client_addr: IpAddr, now: DateTime<Utc>) -> u64 {
        self.bump(
            &keys::auth_failures(client_addr),
            Duration::seconds(VIOLATION_RETENTION_SECS),
            now,
        )
    }

    pub fn observe_request(
        &self,
        client_addr: IpAddr,
        endpoint: &str,
        high_risk: bool,
        now: DateTime<Utc>,
    ) -> RequestTally {
        let segment = network_segment(client_addr);
        let high_risk_endpoint_hits = high_risk.then(|| {
            self.bump(
                &keys::endpoint_hits(client_addr, &normalize_endpoint(endpoint), now),
                Duration::seconds(VIOLATION_RETENTION_SECS),
                now,
            )
        });

        let segment_window = Duration::seconds(SEGMENT_WINDOW_SECS);
        let first_from_address =
            self.bump(&keys::segment_member(&segment, client_addr, now), segment_window, now) == 1;
        let segment_addresses_5m = if first_from_address {
            self.bump(&keys::segment_addresses(&segment, now), segment_window, now)
        } else {
            self.read(&keys::segment_addresses(&segment, now), now)
        };

        RequestTally {
            velocity_per_minute: self.bump(
                &keys::velocity(client_addr, now),
                Duration::seconds(VELOCITY_WINDOW_SECS),
                now,
            ),
            segment_requests_5m: self.bump(
                &keys::segment_requests(&segment, now),
                segment_window,
                now,
            ),
            segment_addresses_5m,
            high_risk_endpoint_hits,
        }
    }

    /// True once per segment window, the first time its traffic is seen
    /// as distributed.
    pub fn first_distributed_alert(&self, segment: &str, now: DateTime<Utc>) -> bool {
        self.bump(
            &keys::segment_alerts(segment, now),
            Duration::seconds(SEGMENT_WINDOW_SECS),
            now,
        ) <= 1
    }

    /// True the first time a suspicious signature is seen for a composite
    /// key within the hour. Keeps one noisy client from flooding the bus.
    pub fn first_sighting(&self, composite_key: &str, now: DateTime<Utc>) -> bool {
        self.bump(
            &keys::signature_sightings(composite_key, now),
            Duration::seconds(VIOLATION_RETENTION_SECS),
            now,
        ) <= 1
    }

    pub fn client_standing(&self, client_addr: IpAddr, now: DateTime<Utc>) -> ClientStanding {
        ClientStanding {
            violations: self.address_violation_count(client_addr, now),
            auth_failures: self.read(&keys::auth_failures(client_addr), now),
        }
    }

    pub fn recent_violations(&self, client_addr: IpAddr, now: DateTime<Utc>) -> Vec<ViolationRecord> {
        self.records
            .get(&client_addr)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| is_retained(record, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired counters and violation records.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let counters = self.store.sweep(now);
        self.records.retain(|_, records| {
            records.retain(|record| is_retained(record, now));
            !records.is_empty()
        });
        counters
    }

    pub fn tracked_counters(&self) -> usize {
        self.store.len()
    }

    fn bump(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> u64 {
        match self.store.increment(key, ttl, now) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, key = key, "counter increment failed; treating as zero");
                0
            }
        }
    }

    fn read(&self, key: &str, now: DateTime<Utc>) -> u64 {
        match self.store.get(key, now) {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                tracing::warn!(error = %err, key = key, "counter read failed; treating as zero");
                0
            }
        }
    }
}

fn is_retained(record: &ViolationRecord, now: DateTime<Utc>) -> bool {
    now - record.timestamp < Duration::seconds(VIOLATION_RETENTION_SECS)
}

/// Collapse numeric path segments so `/api/songs/12` and `/api/songs/13`
/// share a counter, and bound the key length.
pub fn normalize_endpoint(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let normalized = trimmed
        .split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.chars().all(|ch| ch.is_ascii_digit()) {
                "{id}".to_string()
            } else {
                segment.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    let normalized = if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    };
    normalized.chars().take(MAX_ENDPOINT_KEY_LEN).collect()
}
