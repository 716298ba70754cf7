use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    RateLimitViolation,
    MaliciousUrlPattern,
    XssAttempt,
    SqlInjectionAttempt,
    SuspiciousUserAgent,
    AuthenticationFailure,
    DistributedAttack,
    CaptchaChallengeIssued,
    CaptchaSolved,
    CaptchaFailed,
    CaptchaVerifierUnavailable,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 11] = [
        SecurityEventType::RateLimitViolation,
        SecurityEventType::MaliciousUrlPattern,
        SecurityEventType::XssAttempt,
        SecurityEventType::SqlInjectionAttempt,
        SecurityEventType::SuspiciousUserAgent,
        SecurityEventType::AuthenticationFailure,
        SecurityEventType::DistributedAttack,
        SecurityEventType::CaptchaChallengeIssued,
        SecurityEventType::CaptchaSolved,
        SecurityEventType::CaptchaFailed,
        SecurityEventType::CaptchaVerifierUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventType::RateLimitViolation => "rate_limit_violation",
            SecurityEventType::MaliciousUrlPattern => "malicious_url_pattern",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::SqlInjectionAttempt => "sql_injection_attempt",
            SecurityEventType::SuspiciousUserAgent => "suspicious_user_agent",
            SecurityEventType::AuthenticationFailure => "authentication_failure",
            SecurityEventType::DistributedAttack => "distributed_attack",
            SecurityEventType::CaptchaChallengeIssued => "captcha_challenge_issued",
            SecurityEventType::CaptchaSolved => "captcha_solved",
            SecurityEventType::CaptchaFailed => "captcha_failed",
            SecurityEventType::CaptchaVerifierUnavailable => "captcha_verifier_unavailable",
        }
    }

    /// Injection-style detections produced by the pattern sentinel.
    pub fn is_injection(self) -> bool {
        matches!(
            self,
            SecurityEventType::MaliciousUrlPattern
                | SecurityEventType::XssAttempt
                | SecurityEventType::SqlInjectionAttempt
        )
    }
}

/// An immutable record of something the mitigation layer observed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SecurityEvent {
    /// UUIDv7, time-sortable
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_signature: Option<String>,
    /// Structured context. Never holds raw tainted input.
    pub details: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            severity,
            timestamp,
            client_addr: None,
            client_signature: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_client(mut self, addr: Option<String>, signature: Option<String>) -> Self {
        self.client_addr = addr;
        self.client_signature = signature;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Endpoint recorded in the details, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.details.get("endpoint").and_then(|value| value.as_str())
    }
}
