use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use encore_core::security_events::{SecurityEvent, SecurityEventType, Severity};
use encore_core::security_metrics::{self, WindowMetrics};
use serde::Serialize;

pub const EVENT_BUFFER_CAPACITY: usize = 1_000;
const TOP_OFFENDERS: usize = 10;

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct OffenderCount {
    pub key: String,
    pub violations: u64,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SecuritySnapshot {
    /// Events published since process start
    pub total_events: u64,
    pub buffered_events: usize,
    pub counts_by_type: BTreeMap<String, u64>,
    pub counts_by_severity: BTreeMap<String, u64>,
    /// Newest first
    pub recent_events: Vec<SecurityEvent>,
    pub top_offending_addresses: Vec<OffenderCount>,
    pub top_offending_endpoints: Vec<OffenderCount>,
}

/// Sink for every security event. Keeps a bounded recent window plus running
/// per-type and per-severity totals.
pub struct SecurityEventBus {
    recent: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
    total: AtomicU64,
    by_type: DashMap<SecurityEventType, u64>,
    by_severity: DashMap<Severity, u64>,
}

impl Default for SecurityEventBus {
    fn default() -> Self {
        Self::with_capacity(EVENT_BUFFER_CAPACITY)
    }
}

impl SecurityEventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
            by_type: DashMap::new(),
            by_severity: DashMap::new(),
        }
    }

    pub fn publish(&self, event: SecurityEvent) {
        if event.severity == Severity::Critical {
            tracing::error!(
                target: "security_alert",
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                client = event.client_addr.as_deref().unwrap_or("-"),
                details = %event.details,
                "critical security event"
            );
        } else {
            tracing::info!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                severity = event.severity.as_str(),
                client = event.client_addr.as_deref().unwrap_or("-"),
                "security event"
            );
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(event.event_type).or_insert(0) += 1;
        *self.by_severity.entry(event.severity).or_insert(0) += 1;

        let mut recent = self.lock_recent();
        recent.push_back(event);
        while recent.len() > self.capacity {
            recent.pop_front();
        }
    }

    pub fn snapshot(&self, limit: usize) -> SecuritySnapshot {
        let buffered: Vec<SecurityEvent> = self.lock_recent().iter().cloned().collect();

        let mut addresses: HashMap<String, u64> = HashMap::new();
        let mut endpoints: HashMap<String, u64> = HashMap::new();
        for event in buffered
            .iter()
            .filter(|event| event.event_type == SecurityEventType::RateLimitViolation)
        {
            if let Some(addr) = &event.client_addr {
                *addresses.entry(addr.clone()).or_default() += 1;
            }
            if let Some(endpoint) = event.endpoint() {
                *endpoints.entry(endpoint.to_string()).or_default() += 1;
            }
        }

        SecuritySnapshot {
            total_events: self.total.load(Ordering::Relaxed),
            buffered_events: buffered.len(),
            counts_by_type: self
                .by_type
                .iter()
                .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
                .collect(),
            counts_by_severity: self
                .by_severity
                .iter()
                .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
                .collect(),
            recent_events: buffered.iter().rev().take(limit).cloned().collect(),
            top_offending_addresses: top_offenders(addresses),
            top_offending_endpoints: top_offenders(endpoints),
        }
    }

    pub fn metrics_for_window(&self, window: Duration, now: DateTime<Utc>) -> WindowMetrics {
        let buffered: Vec<SecurityEvent> = self.lock_recent().iter().cloned().collect();
        security_metrics::metrics_for_window(&buffered, window, now)
    }

    /// Remove buffered events older than `cutoff`. Running totals are kept.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut recent = self.lock_recent();
        let before = recent.len();
        recent.retain(|event| event.timestamp >= cutoff);
        before - recent.len()
    }

    pub fn len(&self) -> usize {
        self.lock_recent().len()
    }

    fn lock_recent(&self) -> MutexGuard<'_, VecDeque<SecurityEvent>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn top_offenders(counts: HashMap<String, u64>) -> Vec<OffenderCount> {
    let mut offenders: Vec<OffenderCount> = counts
        .into_iter()
        .map(|(key, violations)| OffenderCount { key, violations })
        .collect();
    offenders.sort_by(|a, b| b.violations.cmp(&a.violations).then_with(|| a.key.cmp(&b.key)));
    offenders.truncate(TOP_OFFENDERS);
    offenders
}
