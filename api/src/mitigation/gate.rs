use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use encore_core::security_events::Severity;
use encore_core::sentinel::SignatureVerdict;
use serde::Serialize;

use super::verifier::{ChallengeVerifier, VerifierError, VerifyOutcome};

/// How long an unanswered challenge keeps an address in the Challenged state.
const PENDING_CHALLENGE_TTL_SECS: i64 = 1_800;
const MAX_PROOF_TOKEN_LEN: usize = 2_048;
/// Failed proofs allowed per pending challenge. Past this the verifier is no
/// longer called until the challenge expires.
pub const MAX_FAILED_PROOF_ATTEMPTS: u32 = 5;
/// Combinable signals needed before a challenge is issued.
const CORROBORATING_SIGNAL_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Ungated,
    Required,
    Challenged,
    Bypassed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeReason {
    SuspiciousSignature,
    DistributedAttack,
    CorroboratedSignals,
    HighRiskEndpoint,
}

impl ChallengeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeReason::SuspiciousSignature => "suspicious_signature",
            ChallengeReason::DistributedAttack => "distributed_attack",
            ChallengeReason::CorroboratedSignals => "corroborated_signals",
            ChallengeReason::HighRiskEndpoint => "high_risk_endpoint",
        }
    }
}

/// Signals gathered for one request. Two classes:
/// standalone triggers (a high-severity signature, a distributed attack from
/// the client's segment, a hammered high-risk endpoint) challenge on their
/// own; the remaining weaker signals only count when at least two agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChallengeTriggers {
    pub signature: Option<SignatureVerdict>,
    pub distributed_attack: bool,
    pub high_risk_endpoint: bool,
    pub violation_history: bool,
    pub auth_failures: bool,
    pub velocity: bool,
}

impl ChallengeTriggers {
    pub fn assess(&self) -> Option<ChallengeReason> {
        if self
            .signature
            .is_some_and(|verdict| verdict.severity() >= Severity::High)
        {
            return Some(ChallengeReason::SuspiciousSignature);
        }
        if self.distributed_attack {
            return Some(ChallengeReason::DistributedAttack);
        }
        if self.corroborating_signals().len() >= CORROBORATING_SIGNAL_THRESHOLD {
            return Some(ChallengeReason::CorroboratedSignals);
        }
        if self.high_risk_endpoint {
            return Some(ChallengeReason::HighRiskEndpoint);
        }
        None
    }

    pub fn corroborating_signals(&self) -> Vec<&'static str> {
        let mut signals = Vec::new();
        if self.violation_history {
            signals.push("violation_history");
        }
        if self.auth_failures {
            signals.push("auth_failures");
        }
        if self.velocity {
            signals.push("velocity");
        }
        if self
            .signature
            .is_some_and(|verdict| verdict.severity() < Severity::High)
        {
            signals.push("automation_signature");
        }
        signals
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct BypassGrant {
    pub client_addr: String,
    pub composite_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BypassGrant {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChallenge {
    issued_at: DateTime<Utc>,
    failed_attempts: u32,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Pass,
    Bypassed { expires_at: DateTime<Utc> },
    Required(ChallengeReason),
}

#[derive(Debug)]
pub enum ProofOutcome {
    Granted(BypassGrant),
    Rejected {
        error_codes: Vec<String>,
        failed_attempts: u32,
    },
    Unavailable(VerifierError),
}

/// Decides when a client must prove it is human, validates proofs against
/// the external verifier, and remembers successful proofs as time-limited
/// bypass grants keyed by client address.
pub struct ChallengeGate {
    verifier: Arc<dyn ChallengeVerifier>,
    grants: DashMap<IpAddr, BypassGrant>,
    pending: DashMap<IpAddr, PendingChallenge>,
    grant_ttl: Duration,
}

impl ChallengeGate {
    pub fn new(verifier: Arc<dyn ChallengeVerifier>, grant_ttl: Duration) -> Self {
        Self {
            verifier,
            grants: DashMap::new(),
            pending: DashMap::new(),
            grant_ttl,
        }
    }

    pub fn verifier_configured(&self) -> bool {
        self.verifier.is_configured()
    }

    pub fn decide(
        &self,
        client_addr: IpAddr,
        triggers: &ChallengeTriggers,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if let Some(grant) = self.active_grant(client_addr, now) {
            return GateDecision::Bypassed {
                expires_at: grant.expires_at,
            };
        }
        match triggers.assess() {
            Some(reason) => GateDecision::Required(reason),
            None => GateDecision::Pass,
        }
    }

    pub fn active_grant(&self, client_addr: IpAddr, now: DateTime<Utc>) -> Option<BypassGrant> {
        let grant = self.grants.get(&client_addr).map(|grant| grant.clone())?;
        if grant.is_live(now) {
            return Some(grant);
        }
        self.grants
            .remove_if(&client_addr, |_, grant| !grant.is_live(now));
        None
    }

    /// Record that a challenge was served and no proof has arrived yet.
    pub fn mark_challenged(&self, client_addr: IpAddr, now: DateTime<Utc>) {
        self.pending
            .entry(client_addr)
            .and_modify(|pending| {
                if !pending_is_live(pending, now) {
                    *pending = PendingChallenge {
                        issued_at: now,
                        failed_attempts: 0,
                    };
                }
            })
            .or_insert(PendingChallenge {
                issued_at: now,
                failed_attempts: 0,
            });
    }

    /// Forward a proof token to the verifier. No map guard is held across
    /// the verifier call. Any verifier error is fail-closed: no grant.
    pub async fn submit_proof(
        &self,
        client_addr: IpAddr,
        composite_key: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> ProofOutcome {
        let token = token.trim();
        if token.is_empty() || token.len() > MAX_PROOF_TOKEN_LEN {
            return self.reject(client_addr, vec!["malformed-token".to_string()], now);
        }
        if self.attempts_exhausted(client_addr, now) {
            tracing::warn!(
                client = %client_addr,
                "proof attempts exhausted; verifier not called"
            );
            return self.reject(client_addr, vec!["too-many-attempts".to_string()], now);
        }

        match self.verifier.verify(token, client_addr).await {
            Ok(VerifyOutcome::Verified) => {
                let grant = BypassGrant {
                    client_addr: client_addr.to_string(),
                    composite_key: composite_key.to_string(),
                    issued_at: now,
                    expires_at: now + self.grant_ttl,
                };
                self.pending.remove(&client_addr);
                self.grants.insert(client_addr, grant.clone());
                tracing::info!(
                    client = %client_addr,
                    expires_at = %grant.expires_at,
                    "captcha solved; bypass grant issued"
                );
                ProofOutcome::Granted(grant)
            }
            Ok(VerifyOutcome::Rejected { error_codes }) => {
                self.reject(client_addr, error_codes, now)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    client = %client_addr,
                    "captcha verifier unavailable; withholding bypass"
                );
                self.mark_challenged(client_addr, now);
                ProofOutcome::Unavailable(err)
            }
        }
    }

    pub fn state(&self, client_addr: IpAddr, now: DateTime<Utc>) -> GateState {
        if self.active_grant(client_addr, now).is_some() {
            return GateState::Bypassed;
        }
        let challenged = self
            .pending
            .get(&client_addr)
            .is_some_and(|pending| pending_is_live(&pending, now));
        if challenged {
            GateState::Challenged
        } else {
            GateState::Ungated
        }
    }

    /// Drop expired grants and stale pending challenges.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.grants.len() + self.pending.len();
        self.grants.retain(|_, grant| grant.is_live(now));
        self.pending.retain(|_, pending| pending_is_live(pending, now));
        before.saturating_sub(self.grants.len() + self.pending.len())
    }

    pub fn active_grants(&self) -> usize {
        self.grants.len()
    }

    fn attempts_exhausted(&self, client_addr: IpAddr, now: DateTime<Utc>) -> bool {
        self.pending.get(&client_addr).is_some_and(|pending| {
            pending_is_live(&pending, now) && pending.failed_attempts >= MAX_FAILED_PROOF_ATTEMPTS
        })
    }

    fn reject(
        &self,
        client_addr: IpAddr,
        error_codes: Vec<String>,
        now: DateTime<Utc>,
    ) -> ProofOutcome {
        self.mark_challenged(client_addr, now);
        let failed_attempts = self
            .pending
            .get_mut(&client_addr)
            .map(|mut pending| {
                pending.failed_attempts = pending.failed_attempts.saturating_add(1);
                pending.failed_attempts
            })
            .unwrap_or(1);
        ProofOutcome::Rejected {
            error_codes,
            failed_attempts,
        }
    }
}

fn pending_is_live(pending: &PendingChallenge, now: DateTime<Utc>) -> bool {
    now - pending.issued_at < Duration::seconds(PENDING_CHALLENGE_TTL_SECS)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mitigation::verifier::VerifyFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Verifier double with a fixed answer.
    pub(crate) struct StaticVerifier {
        pub answer: fn() -> Result<VerifyOutcome, VerifierError>,
        pub calls: AtomicUsize,
    }

    impl StaticVerifier {
        pub(crate) fn new(answer: fn() -> Result<VerifyOutcome, VerifierError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn verified() -> Arc<Self> {
            Self::new(|| Ok(VerifyOutcome::Verified))
        }

        pub(crate) fn rejected() -> Arc<Self> {
            Self::new(|| {
                Ok(VerifyOutcome::Rejected {
                    error_codes: vec!["invalid-input-response".to_string()],
                })
            })
        }

        pub(crate) fn offline() -> Arc<Self> {
            Self::new(|| Err(VerifierError::Transport("connection refused".to_string())))
        }
    }

    impl ChallengeVerifier for StaticVerifier {
        fn verify<'a>(&'a self, _token: &'a str, _client_addr: IpAddr) -> VerifyFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = (self.answer)();
            Box::pin(async move { answer })
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    fn gate(verifier: Arc<StaticVerifier>) -> ChallengeGate {
        ChallengeGate::new(verifier, Duration::minutes(30))
    }

    fn client() -> IpAddr {
        "203.0.113.5".parse().expect("valid ip")
    }

    fn scanner() -> ChallengeTriggers {
        ChallengeTriggers {
            signature: Some(SignatureVerdict::Scanner("sqlmap")),
            ..Default::default()
        }
    }

    #[test]
    fn no_triggers_never_challenges() {
        let gate = gate(StaticVerifier::verified());
        let now = Utc::now();
        for _ in 0..5 {
            assert!(matches!(
                gate.decide(client(), &ChallengeTriggers::default(), now),
                GateDecision::Pass
            ));
        }
        assert_eq!(gate.state(client(), now), GateState::Ungated);
    }

    #[test]
    fn high_severity_signature_alone_challenges() {
        let gate = gate(StaticVerifier::verified());
        let decision = gate.decide(client(), &scanner(), Utc::now());
        assert!(matches!(
            decision,
            GateDecision::Required(ChallengeReason::SuspiciousSignature)
        ));
        let missing = ChallengeTriggers {
            signature: Some(SignatureVerdict::Missing),
            ..Default::default()
        };
        assert_eq!(missing.assess(), Some(ChallengeReason::SuspiciousSignature));
    }

    #[test]
    fn single_weak_signal_is_not_enough() {
        for triggers in [
            ChallengeTriggers { violation_history: true, ..Default::default() },
            ChallengeTriggers { auth_failures: true, ..Default::default() },
            ChallengeTriggers { velocity: true, ..Default::default() },
            ChallengeTriggers {
                signature: Some(SignatureVerdict::Automation("curl/")),
                ..Default::default()
            },
        ] {
            assert_eq!(triggers.assess(), None);
        }
    }

    #[test]
    fn two_weak_signals_corroborate() {
        let triggers = ChallengeTriggers {
            violation_history: true,
            velocity: true,
            ..Default::default()
        };
        assert_eq!(triggers.assess(), Some(ChallengeReason::CorroboratedSignals));
        let with_automation = ChallengeTriggers {
            auth_failures: true,
            signature: Some(SignatureVerdict::Automation("python-requests")),
            ..Default::default()
        };
        assert_eq!(
            with_automation.corroborating_signals(),
            vec!["auth_failures", "automation_signature"]
        );
        assert_eq!(with_automation.assess(), Some(ChallengeReason::CorroboratedSignals));
    }

    #[test]
    fn distributed_attack_and_hammered_endpoint_are_standalone() {
        let distributed = ChallengeTriggers { distributed_attack: true, ..Default::default() };
        assert_eq!(distributed.assess(), Some(ChallengeReason::DistributedAttack));
        let endpoint = ChallengeTriggers { high_risk_endpoint: true, ..Default::default() };
        assert_eq!(endpoint.assess(), Some(ChallengeReason::HighRiskEndpoint));
    }

    #[tokio::test]
    async fn successful_proof_grants_thirty_minutes() {
        let gate = gate(StaticVerifier::verified());
        let t = Utc::now();
        gate.mark_challenged(client(), t);
        assert_eq!(gate.state(client(), t), GateState::Challenged);

        let outcome = gate.submit_proof(client(), "key", "proof-token", t).await;
        let grant = match outcome {
            ProofOutcome::Granted(grant) => grant,
            other => panic!("expected grant, got {other:?}"),
        };
        assert_eq!(grant.expires_at, t + Duration::minutes(30));
        assert_eq!(gate.state(client(), t), GateState::Bypassed);

        let during = t + Duration::minutes(29);
        assert!(matches!(
            gate.decide(client(), &scanner(), during),
            GateDecision::Bypassed { .. }
        ));

        let after = t + Duration::minutes(31);
        assert!(matches!(
            gate.decide(client(), &scanner(), after),
            GateDecision::Required(ChallengeReason::SuspiciousSignature)
        ));
        assert_eq!(gate.active_grants(), 0);
    }

    #[tokio::test]
    async fn rejected_proof_creates_no_grant_and_counts_attempts() {
        let gate = gate(StaticVerifier::rejected());
        let now = Utc::now();
        gate.mark_challenged(client(), now);
        let first = gate.submit_proof(client(), "key", "bad", now).await;
        let second = gate.submit_proof(client(), "key", "bad", now).await;
        assert!(matches!(first, ProofOutcome::Rejected { failed_attempts: 1, .. }));
        assert!(matches!(second, ProofOutcome::Rejected { failed_attempts: 2, .. }));
        assert_eq!(gate.state(client(), now), GateState::Challenged);
        assert!(gate.active_grant(client(), now).is_none());
    }

    #[tokio::test]
    async fn repeated_failures_stop_reaching_the_verifier() {
        let verifier = StaticVerifier::rejected();
        let gate = gate(verifier.clone());
        let now = Utc::now();
        for _ in 0..MAX_FAILED_PROOF_ATTEMPTS {
            gate.submit_proof(client(), "key", "bad", now).await;
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 5);

        let locked = gate.submit_proof(client(), "key", "bad", now).await;
        match locked {
            ProofOutcome::Rejected { error_codes, .. } => {
                assert_eq!(error_codes, vec!["too-many-attempts".to_string()]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 5);

        let expired = now + Duration::seconds(PENDING_CHALLENGE_TTL_SECS + 1);
        gate.submit_proof(client(), "key", "bad", expired).await;
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn verifier_outage_is_fail_closed() {
        let gate = gate(StaticVerifier::offline());
        let now = Utc::now();
        let outcome = gate.submit_proof(client(), "key", "proof", now).await;
        assert!(matches!(outcome, ProofOutcome::Unavailable(_)));
        assert!(matches!(
            gate.decide(client(), &scanner(), now),
            GateDecision::Required(_)
        ));
        assert_eq!(gate.active_grants(), 0);
    }

    #[tokio::test]
    async fn malformed_token_skips_verifier() {
        let verifier = StaticVerifier::verified();
        let gate = gate(verifier.clone());
        let outcome = gate.submit_proof(client(), "key", "   ", Utc::now()).await;
        assert!(matches!(outcome, ProofOutcome::Rejected { .. }));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sweep_drops_expired_grants_and_pending() {
        let gate = gate(StaticVerifier::verified());
        let now = Utc::now();
        let other: IpAddr = "198.51.100.2".parse().expect("valid ip");
        gate.submit_proof(client(), "key", "proof", now).await;
        gate.mark_challenged(other, now);
        assert_eq!(gate.sweep(now + Duration::minutes(45)), 2);
        assert_eq!(gate.state(other, now + Duration::minutes(45)), GateState::Ungated);
    }
}
