//! Adaptive rate limiting and bot mitigation.
//!
//! [`MitigationEngine`] owns the shared state (violation ledger, challenge
//! gate, event bus, per-policy quotas). The tower middleware drives it once
//! per request; the admin and challenge routes read from it.

pub mod bus;
pub mod challenge;
pub mod counter_store;
pub mod gate;
pub mod ledger;
pub mod quota;
pub mod request;
pub mod verifier;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use encore_core::fingerprint::{CompositeKey, network_segment};
use encore_core::policy::{RateLimitPolicy, is_high_risk_endpoint};
use encore_core::security_events::{SecurityEvent, SecurityEventType, Severity};
use encore_core::sentinel::{self, Detection, SignatureVerdict};
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use bus::SecurityEventBus;
use counter_store::{CounterStore, InMemoryCounterStore};
use gate::{BypassGrant, ChallengeGate, ChallengeReason, ChallengeTriggers, GateState, ProofOutcome};
use ledger::{
    AUTH_FAILURE_THRESHOLD, ClientStanding, RequestTally, ViolationLedger,
    ViolationRecord, ViolationTally, normalize_endpoint,
};
use quota::{PolicyQuotas, QuotaCheck};
use request::RequestAttributes;
use verifier::{ChallengeVerifier, TurnstileVerifier};

/// Signals gathered for one request before the gate decides.
#[derive(Debug, Clone, Copy)]
pub struct Assessment {
    pub tally: RequestTally,
    pub standing: ClientStanding,
    pub triggers: ChallengeTriggers,
}

/// Admin view of one client address.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct GateStatus {
    pub client_addr: String,
    pub state: GateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<BypassGrant>,
    pub standing: ClientStanding,
    pub recent_violations: Vec<ViolationRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_counters: usize,
    pub expired_gate_entries: usize,
    pub purged_events: usize,
}

pub struct MitigationEngine {
    pub ledger: ViolationLedger,
    pub gate: ChallengeGate,
    pub bus: SecurityEventBus,
    pub quotas: PolicyQuotas,
    site_key: Option<String>,
    trust_forwarded_for: bool,
    max_inspected_body_bytes: usize,
    event_retention: chrono::Duration,
}

impl MitigationEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn CounterStore>,
        verifier: Arc<dyn ChallengeVerifier>,
    ) -> Self {
        Self {
            ledger: ViolationLedger::new(store),
            gate: ChallengeGate::new(verifier, config.bypass_grant_ttl),
            bus: SecurityEventBus::default(),
            quotas: PolicyQuotas::new(),
            site_key: config.turnstile_site_key.clone(),
            trust_forwarded_for: config.trust_forwarded_for,
            max_inspected_body_bytes: config.max_inspected_body_bytes,
            event_retention: config.event_retention,
        }
    }

    /// Production wiring: in-process counters and the Turnstile verifier.
    pub fn from_config(config: &Config) -> Self {
        let verifier = TurnstileVerifier::new(
            config.turnstile_verify_url.clone(),
            config.turnstile_secret_key.clone(),
            config.turnstile_expected_hostname.clone(),
            config.verify_timeout,
        );
        Self::new(
            config,
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(verifier),
        )
    }

    pub fn site_key(&self) -> Option<&str> {
        self.site_key.as_deref()
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    pub fn max_inspected_body_bytes(&self) -> usize {
        self.max_inspected_body_bytes
    }

    /// Publish one event per sentinel detection. Only the location and the
    /// matched signature label are recorded, never the offending input.
    pub fn report_detections(
        &self,
        attrs: &RequestAttributes,
        detections: &[Detection],
        now: DateTime<Utc>,
    ) {
        for detection in detections {
            self.publish(
                attrs,
                detection.event_type,
                detection.severity,
                json!({
                    "endpoint": normalize_endpoint(&attrs.path),
                    "method": attrs.method,
                    "location": detection.location.as_label(),
                    "signature": detection.signature,
                }),
                now,
            );
        }
    }

    /// Bump the per-request counters and collect every challenge signal.
    pub fn assess(
        &self,
        attrs: &RequestAttributes,
        composite_key: &CompositeKey,
        now: DateTime<Utc>,
    ) -> Assessment {
        let signature = sentinel::inspect_signature(attrs.client_signature.as_deref());
        if let Some(verdict) = signature
            && self.ledger.first_sighting(composite_key.as_str(), now)
        {
            self.report_signature(attrs, verdict, now);
        }

        let tally = self.ledger.observe_request(
            attrs.client_addr,
            &attrs.path,
            is_high_risk_endpoint(&attrs.path),
            now,
        );
        let segment = network_segment(attrs.client_addr);
        if tally.distributed_attack() && self.ledger.first_distributed_alert(&segment, now) {
            self.publish(
                attrs,
                SecurityEventType::DistributedAttack,
                Severity::High,
                json!({
                    "endpoint": normalize_endpoint(&attrs.path),
                    "segment": segment,
                    "requests_5m": tally.segment_requests_5m,
                    "addresses_5m": tally.segment_addresses_5m,
                }),
                now,
            );
        }

        let standing = self.ledger.client_standing(attrs.client_addr, now);
        Assessment {
            tally,
            standing,
            triggers: ChallengeTriggers {
                signature,
                distributed_attack: tally.distributed_attack(),
                high_risk_endpoint: tally.high_risk_endpoint_exceeded(),
                violation_history: standing.violation_history_exceeded(),
                auth_failures: standing.auth_failures_exceeded(),
                velocity: tally.velocity_exceeded(),
            },
        }
    }

    pub fn challenge_issued(
        &self,
        attrs: &RequestAttributes,
        reason: ChallengeReason,
        triggers: &ChallengeTriggers,
        now: DateTime<Utc>,
    ) {
        self.gate.mark_challenged(attrs.client_addr, now);
        self.publish(
            attrs,
            SecurityEventType::CaptchaChallengeIssued,
            Severity::Low,
            json!({
                "endpoint": normalize_endpoint(&attrs.path),
                "reason": reason.as_str(),
                "signals": triggers.corroborating_signals(),
            }),
            now,
        );
    }

    /// Proof submissions are throttled on the auth tier, keyed by address,
    /// since each one costs an outbound verifier call. Returns the wait in
    /// seconds when the submission must be refused.
    pub fn throttle_proof(
        &self,
        attrs: &RequestAttributes,
        composite_key: &CompositeKey,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let throttle_key = format!("proof:{}", attrs.client_addr);
        match self.quotas.check(RateLimitPolicy::Auth, &throttle_key) {
            QuotaCheck::Allowed => None,
            QuotaCheck::Exceeded { retry_after_secs } => {
                self.record_rate_violation(attrs, composite_key, RateLimitPolicy::Auth, now);
                Some(retry_after_secs)
            }
        }
    }

    /// Verify a proof and publish the outcome.
    pub async fn submit_proof(
        &self,
        attrs: &RequestAttributes,
        composite_key: &CompositeKey,
        token: &str,
        now: DateTime<Utc>,
    ) -> ProofOutcome {
        let outcome = self
            .gate
            .submit_proof(attrs.client_addr, composite_key.as_str(), token, now)
            .await;

        let endpoint = normalize_endpoint(&attrs.path);
        match &outcome {
            ProofOutcome::Granted(grant) => self.publish(
                attrs,
                SecurityEventType::CaptchaSolved,
                Severity::Low,
                json!({ "endpoint": endpoint, "expires_at": grant.expires_at }),
                now,
            ),
            ProofOutcome::Rejected {
                error_codes,
                failed_attempts,
            } => self.publish(
                attrs,
                SecurityEventType::CaptchaFailed,
                Severity::Medium,
                json!({
                    "endpoint": endpoint,
                    "error_codes": error_codes,
                    "failed_attempts": failed_attempts,
                }),
                now,
            ),
            ProofOutcome::Unavailable(err) => self.publish(
                attrs,
                SecurityEventType::CaptchaVerifierUnavailable,
                Severity::High,
                json!({ "endpoint": endpoint, "error": err.to_string() }),
                now,
            ),
        }
        outcome
    }

    pub fn record_rate_violation(
        &self,
        attrs: &RequestAttributes,
        composite_key: &CompositeKey,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> ViolationTally {
        let tally = self.ledger.record_violation(
            composite_key.as_str(),
            attrs.client_addr,
            &attrs.path,
            attrs.client_signature.as_deref(),
            attrs.identity.as_deref(),
            now,
        );
        self.publish(
            attrs,
            SecurityEventType::RateLimitViolation,
            tally.severity(),
            json!({
                "endpoint": normalize_endpoint(&attrs.path),
                "policy": policy.as_str(),
                "key_violations": tally.key_count,
                "address_violations": tally.address_count,
                "endpoint_violations": tally.endpoint_count,
            }),
            now,
        );
        tally
    }

    /// Count a failed login for the address. Callable from the identity
    /// subsystem as well as from observed 401 responses.
    pub fn record_auth_failure(
        &self,
        client_addr: IpAddr,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> u64 {
        let failures = self.ledger.record_auth_failure(client_addr, now);
        let severity = if failures >= AUTH_FAILURE_THRESHOLD {
            Severity::Medium
        } else {
            Severity::Low
        };
        self.bus.publish(
            SecurityEvent::new(SecurityEventType::AuthenticationFailure, severity, now)
                .with_client(Some(client_addr.to_string()), None)
                .with_details(json!({
                    "endpoint": normalize_endpoint(endpoint),
                    "failures": failures,
                })),
        );
        failures
    }

    /// Gate state as an operator would see it: an address that has not been
    /// challenged yet but whose standing alone warrants one is `Required`.
    pub fn gate_status(&self, client_addr: IpAddr, now: DateTime<Utc>) -> GateStatus {
        let standing = self.ledger.client_standing(client_addr, now);
        let mut state = self.gate.state(client_addr, now);
        if state == GateState::Ungated {
            let triggers = ChallengeTriggers {
                violation_history: standing.violation_history_exceeded(),
                auth_failures: standing.auth_failures_exceeded(),
                ..Default::default()
            };
            if triggers.assess().is_some() {
                state = GateState::Required;
            }
        }
        GateStatus {
            client_addr: client_addr.to_string(),
            state,
            grant: self.gate.active_grant(client_addr, now),
            standing,
            recent_violations: self.ledger.recent_violations(client_addr, now),
        }
    }

    pub fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        self.quotas.retain_recent();
        MaintenanceReport {
            expired_counters: self.ledger.sweep(now),
            expired_gate_entries: self.gate.sweep(now),
            purged_events: self.bus.purge_older_than(now - self.event_retention),
        }
    }

    fn report_signature(
        &self,
        attrs: &RequestAttributes,
        verdict: SignatureVerdict,
        now: DateTime<Utc>,
    ) {
        self.publish(
            attrs,
            SecurityEventType::SuspiciousUserAgent,
            verdict.severity(),
            json!({
                "endpoint": normalize_endpoint(&attrs.path),
                "marker": verdict.marker(),
            }),
            now,
        );
    }

    fn publish(
        &self,
        attrs: &RequestAttributes,
        event_type: SecurityEventType,
        severity: Severity,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.bus.publish(
            SecurityEvent::new(event_type, severity, now)
                .with_client(attrs.client_label(), attrs.client_signature.clone())
                .with_details(details),
        );
    }
}

/// Periodic cleanup of counters, grants, limiter keys and old events.
pub fn spawn_maintenance(
    engine: Arc<MitigationEngine>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = engine.run_maintenance(Utc::now());
            tracing::debug!(
                expired_counters = report.expired_counters,
                expired_gate_entries = report.expired_gate_entries,
                purged_events = report.purged_events,
                tracked_limiter_keys = engine.quotas.tracked_keys(),
                "mitigation maintenance pass"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitigation::gate::tests::StaticVerifier;
    use axum::body::Body;
    use axum::extract::Request;
    use chrono::{Duration, TimeZone};

    fn window_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 20, 20, 0).unwrap()
    }

    fn engine() -> MitigationEngine {
        MitigationEngine::new(
            &Config::default(),
            Arc::new(InMemoryCounterStore::new()),
            StaticVerifier::verified(),
        )
    }

    fn attrs(uri: &str, addr: &str, user_agent: &str) -> RequestAttributes {
        let req = Request::builder()
            .uri(uri)
            .header("x-forwarded-for", addr)
            .header("user-agent", user_agent)
            .body(Body::empty())
            .expect("request");
        RequestAttributes::from_request(&req, true)
    }

    #[test]
    fn scanner_signature_triggers_and_is_reported_once() {
        let engine = engine();
        let attrs = attrs("/api/songs", "203.0.113.5", "sqlmap/1.7");
        let key = encore_core::fingerprint::compose_key(&attrs.factors());
        let now = Utc::now();

        let first = engine.assess(&attrs, &key, now);
        let second = engine.assess(&attrs, &key, now);
        assert_eq!(
            first.triggers.assess(),
            Some(ChallengeReason::SuspiciousSignature)
        );
        assert!(second.triggers.assess().is_some());
        assert_eq!(
            engine.bus.snapshot(10).counts_by_type["suspicious_user_agent"],
            1
        );
    }

    #[test]
    fn clean_browser_request_raises_nothing() {
        let engine = engine();
        let attrs = attrs("/songs/", "198.51.100.7", "Mozilla/5.0 (X11; Linux x86_64)");
        let key = encore_core::fingerprint::compose_key(&attrs.factors());
        let assessment = engine.assess(&attrs, &key, Utc::now());
        assert!(assessment.triggers.assess().is_none());
        assert_eq!(engine.bus.len(), 0);
    }

    #[test]
    fn gate_status_reports_required_from_standing() {
        let engine = engine();
        let client: IpAddr = "192.0.2.44".parse().expect("ip");
        let now = Utc::now();
        for _ in 0..4 {
            engine.ledger.record_violation("k", client, "/accounts/login", None, None, now);
        }
        for _ in 0..3 {
            engine.record_auth_failure(client, "/accounts/login", now);
        }
        let status = engine.gate_status(client, now);
        assert_eq!(status.state, GateState::Required);
        assert_eq!(status.recent_violations.len(), 4);
        assert_eq!(status.standing.auth_failures, 3);
    }

    #[test]
    fn auth_failure_severity_rises_at_threshold() {
        let engine = engine();
        let client: IpAddr = "192.0.2.45".parse().expect("ip");
        let now = Utc::now();
        for _ in 0..3 {
            engine.record_auth_failure(client, "/accounts/login/", now);
        }
        let snapshot = engine.bus.snapshot(10);
        assert_eq!(snapshot.recent_events[0].severity, Severity::Medium);
        assert_eq!(snapshot.recent_events[2].severity, Severity::Low);
    }

    #[test]
    fn maintenance_purges_events_past_retention() {
        let engine = engine();
        let now = Utc::now();
        engine.bus.publish(SecurityEvent::new(
            SecurityEventType::XssAttempt,
            Severity::High,
            now - Duration::days(8),
        ));
        engine.bus.publish(SecurityEvent::new(
            SecurityEventType::XssAttempt,
            Severity::High,
            now,
        ));
        let report = engine.run_maintenance(now);
        assert_eq!(report.purged_events, 1);
        assert_eq!(engine.bus.len(), 1);
    }

    #[test]
    fn rate_violation_is_published_with_policy() {
        let engine = engine();
        let attrs = attrs("/accounts/login/", "203.0.113.8", "Mozilla/5.0");
        let key = encore_core::fingerprint::compose_key(&attrs.factors());
        let tally = engine.record_rate_violation(&attrs, &key, RateLimitPolicy::Auth, Utc::now());
        assert_eq!(tally.address_count, 1);
        let snapshot = engine.bus.snapshot(1);
        assert_eq!(snapshot.recent_events[0].details["policy"], "auth");
        assert_eq!(snapshot.top_offending_addresses[0].key, "203.0.113.8");
    }

    #[test]
    fn steady_single_browser_is_not_treated_as_distributed() {
        let engine = engine();
        let attrs = attrs("/api/songs", "198.51.100.7", "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Firefox/128.0");
        let key = encore_core::fingerprint::compose_key(&attrs.factors());
        let mut last = None;
        for request in 0..51 {
            last = Some(engine.assess(&attrs, &key, window_start() + Duration::seconds(request * 5)));
        }
        let assessment = last.expect("assessed");
        assert_eq!(assessment.tally.segment_requests_5m, 51);
        assert!(!assessment.triggers.distributed_attack);
        assert!(assessment.triggers.assess().is_none());
        assert_eq!(engine.bus.len(), 0);
    }

    #[test]
    fn many_hosts_in_one_segment_raise_a_single_distributed_event() {
        let engine = engine();
        let now = window_start();
        let mut reasons = Vec::new();
        for host in 1..=60u8 {
            let attrs = attrs(
                "/api/songs",
                &format!("203.0.113.{host}"),
                "Mozilla/5.0 (X11; Linux x86_64)",
            );
            let key = encore_core::fingerprint::compose_key(&attrs.factors());
            reasons.push(engine.assess(&attrs, &key, now).triggers.assess());
        }
        assert!(reasons[..50].iter().all(Option::is_none));
        assert_eq!(reasons[50], Some(ChallengeReason::DistributedAttack));
        assert_eq!(engine.bus.snapshot(10).counts_by_type["distributed_attack"], 1);
    }

    #[test]
    fn velocity_with_violation_history_corroborates() {
        let engine = engine();
        let attrs = attrs("/api/songs", "192.0.2.60", "Mozilla/5.0 (X11; Linux x86_64)");
        let key = encore_core::fingerprint::compose_key(&attrs.factors());
        let now = window_start();

        let mut fast = None;
        for _ in 0..101 {
            fast = Some(engine.assess(&attrs, &key, now));
        }
        let fast = fast.expect("assessed");
        assert!(fast.triggers.velocity);
        assert_eq!(fast.triggers.assess(), None);

        for _ in 0..4 {
            engine.record_rate_violation(&attrs, &key, RateLimitPolicy::Api, now);
        }
        let corroborated = engine.assess(&attrs, &key, now + Duration::seconds(1));
        assert!(corroborated.triggers.violation_history);
        assert!(corroborated.triggers.velocity);
        assert_eq!(
            corroborated.triggers.assess(),
            Some(ChallengeReason::CorroboratedSignals)
        );
    }

    #[test]
    fn proof_submissions_are_throttled_per_address() {
        let engine = engine();
        let client = attrs("/challenge/verify", "203.0.113.70", "Mozilla/5.0");
        let key = encore_core::fingerprint::compose_key(&client.factors());
        let now = Utc::now();
        for _ in 0..RateLimitPolicy::Auth.requests_per_minute() {
            assert_eq!(engine.throttle_proof(&client, &key, now), None);
        }
        assert!(engine.throttle_proof(&client, &key, now).is_some());
        assert_eq!(engine.bus.snapshot(1).recent_events[0].details["policy"], "auth");

        let neighbour = attrs("/challenge/verify", "203.0.113.71", "Mozilla/5.0");
        assert_eq!(engine.throttle_proof(&neighbour, &key, now), None);
    }
}
