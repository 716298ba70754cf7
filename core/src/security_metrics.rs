use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::security_events::{SecurityEvent, SecurityEventType, Severity};

const CRITICAL_DEDUCTION: i64 = 10;
const HIGH_DEDUCTION: i64 = 5;
const MEDIUM_DEDUCTION: i64 = 2;

const CRITICAL_THREAT_CRITICAL_EVENTS: u64 = 10;
const HIGH_THREAT_HIGH_EVENTS: u64 = 20;
const MEDIUM_THREAT_HIGH_EVENTS: u64 = 5;
const MEDIUM_THREAT_MEDIUM_EVENTS: u64 = 20;

const TIGHTEN_RATE_LIMITS_VIOLATIONS: u64 = 50;
const AUTOMATION_SIGNATURE_EVENTS: u64 = 20;
const AUTH_FAILURE_EVENTS: u64 = 20;
const CAPTCHA_FAILURE_EVENTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Derived picture of one time window of security events.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WindowMetrics {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_events: u64,
    pub counts_by_type: BTreeMap<String, u64>,
    pub counts_by_severity: BTreeMap<String, u64>,
    /// Events per hour, per category
    pub rate_per_hour: BTreeMap<String, f64>,
    /// 0-100, higher is calmer
    pub security_score: u8,
    pub threat_level: ThreatLevel,
    /// Change in event volume versus the preceding window of equal length
    pub trend_percent: f64,
    pub previous_window_total: u64,
    pub recommendations: Vec<String>,
}

/// Compute metrics for `(now - window, now]`, comparing against the window
/// immediately before it.
pub fn metrics_for_window(
    events: &[SecurityEvent],
    window: Duration,
    now: DateTime<Utc>,
) -> WindowMetrics {
    let window_start = now - window;
    let previous_start = window_start - window;

    let current: Vec<&SecurityEvent> = events
        .iter()
        .filter(|event| event.timestamp > window_start && event.timestamp <= now)
        .collect();
    let previous_window_total = events
        .iter()
        .filter(|event| event.timestamp > previous_start && event.timestamp <= window_start)
        .count() as u64;

    let mut counts_by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut counts_by_severity: BTreeMap<String, u64> = Severity::ALL
        .iter()
        .map(|severity| (severity.as_str().to_string(), 0))
        .collect();
    for event in &current {
        *counts_by_type
            .entry(event.event_type.as_str().to_string())
            .or_default() += 1;
        *counts_by_severity
            .entry(event.severity.as_str().to_string())
            .or_default() += 1;
    }

    let hours = (window.num_seconds().max(1) as f64) / 3600.0;
    let rate_per_hour = counts_by_type
        .iter()
        .map(|(event_type, count)| (event_type.clone(), *count as f64 / hours))
        .collect();

    let severity_count = |severity: Severity| {
        counts_by_severity
            .get(severity.as_str())
            .copied()
            .unwrap_or(0)
    };
    let critical = severity_count(Severity::Critical);
    let high = severity_count(Severity::High);
    let medium = severity_count(Severity::Medium);

    let total_events = current.len() as u64;
    let type_count =
        |event_type: SecurityEventType| counts_by_type.get(event_type.as_str()).copied().unwrap_or(0);

    let injections = current
        .iter()
        .filter(|event| event.event_type.is_injection())
        .count() as u64;
    let advice = recommendations(critical, injections, &type_count);

    WindowMetrics {
        window_start,
        window_end: now,
        total_events,
        counts_by_type,
        counts_by_severity,
        rate_per_hour,
        security_score: security_score(critical, high, medium),
        threat_level: threat_level(critical, high, medium),
        trend_percent: trend_percent(total_events, previous_window_total),
        previous_window_total,
        recommendations: advice,
    }
}

pub fn security_score(critical: u64, high: u64, medium: u64) -> u8 {
    let deductions = critical as i64 * CRITICAL_DEDUCTION
        + high as i64 * HIGH_DEDUCTION
        + medium as i64 * MEDIUM_DEDUCTION;
    (100 - deductions).clamp(0, 100) as u8
}

pub fn threat_level(critical: u64, high: u64, medium: u64) -> ThreatLevel {
    if critical >= CRITICAL_THREAT_CRITICAL_EVENTS {
        ThreatLevel::Critical
    } else if critical > 0 || high >= HIGH_THREAT_HIGH_EVENTS {
        ThreatLevel::High
    } else if high >= MEDIUM_THREAT_HIGH_EVENTS || medium >= MEDIUM_THREAT_MEDIUM_EVENTS {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

pub fn trend_percent(current: u64, previous: u64) -> f64 {
    if previous == 0 {
        return if current > 0 { 100.0 } else { 0.0 };
    }
    (current as f64 - previous as f64) / previous as f64 * 100.0
}

fn recommendations(
    critical: u64,
    injections: u64,
    type_count: &dyn Fn(SecurityEventType) -> u64,
) -> Vec<String> {
    let mut out = Vec::new();

    if critical > 0 {
        out.push(format!(
            "Investigate {critical} critical security event(s) immediately."
        ));
    }
    let violations = type_count(SecurityEventType::RateLimitViolation);
    if violations >= TIGHTEN_RATE_LIMITS_VIOLATIONS {
        out.push(format!(
            "Tighten rate limits: {violations} rate-limit violations in this window."
        ));
    }
    if injections > 0 {
        out.push(format!(
            "Review input validation and escaping: {injections} injection pattern(s) detected."
        ));
    }
    if type_count(SecurityEventType::SuspiciousUserAgent) >= AUTOMATION_SIGNATURE_EVENTS {
        out.push("Consider blocking persistent automation signatures at the edge.".to_string());
    }
    if type_count(SecurityEventType::DistributedAttack) > 0 {
        out.push("Investigate coordinated traffic from shared network segments.".to_string());
    }
    if type_count(SecurityEventType::AuthenticationFailure) >= AUTH_FAILURE_EVENTS {
        out.push("Add protection to authentication endpoints; credential stuffing is likely.".to_string());
    }
    if type_count(SecurityEventType::CaptchaFailed) >= CAPTCHA_FAILURE_EVENTS {
        out.push("Review challenge failures; automated solvers may be active.".to_string());
    }
    if type_count(SecurityEventType::CaptchaVerifierUnavailable) > 0 {
        out.push("Check connectivity to the captcha verification service.".to_string());
    }

    out
}
