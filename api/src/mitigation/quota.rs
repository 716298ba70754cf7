use std::collections::HashMap;
use std::num::NonZeroU32;

use encore_core::policy::RateLimitPolicy;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Allowed,
    Exceeded { retry_after_secs: u64 },
}

/// One keyed GCRA limiter per policy tier, partitioned by composite key.
pub struct PolicyQuotas {
    limiters: HashMap<RateLimitPolicy, DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl Default for PolicyQuotas {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyQuotas {
    pub fn new() -> Self {
        let limiters = RateLimitPolicy::ALL
            .into_iter()
            .map(|policy| (policy, RateLimiter::keyed(quota_for(policy))))
            .collect();
        Self {
            limiters,
            clock: DefaultClock::default(),
        }
    }

    pub fn check(&self, policy: RateLimitPolicy, composite_key: &str) -> QuotaCheck {
        let Some(limiter) = self.limiters.get(&policy) else {
            return QuotaCheck::Allowed;
        };
        match limiter.check_key(&composite_key.to_string()) {
            Ok(()) => QuotaCheck::Allowed,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                QuotaCheck::Exceeded {
                    retry_after_secs: wait.as_secs().max(1),
                }
            }
        }
    }

    /// Forget keys whose buckets have fully refilled.
    pub fn retain_recent(&self) {
        for limiter in self.limiters.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiters.values().map(|limiter| limiter.len()).sum()
    }
}

/// Per-minute quota with a burst equal to the per-minute allowance, so a
/// fresh client can spend its whole minute up front.
fn quota_for(policy: RateLimitPolicy) -> Quota {
    let per_minute = NonZeroU32::new(policy.requests_per_minute()).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(per_minute).allow_burst(per_minute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_tier_allows_burst_then_rejects() {
        let quotas = PolicyQuotas::new();
        for _ in 0..RateLimitPolicy::Auth.requests_per_minute() {
            assert_eq!(quotas.check(RateLimitPolicy::Auth, "key-a"), QuotaCheck::Allowed);
        }
        match quotas.check(RateLimitPolicy::Auth, "key-a") {
            QuotaCheck::Exceeded { retry_after_secs } => assert!(retry_after_secs >= 1),
            QuotaCheck::Allowed => panic!("sixth auth request within a minute must be rejected"),
        }
    }

    #[test]
    fn keys_and_policies_are_partitioned() {
        let quotas = PolicyQuotas::new();
        for _ in 0..5 {
            quotas.check(RateLimitPolicy::Auth, "key-a");
        }
        assert_eq!(quotas.check(RateLimitPolicy::Auth, "key-b"), QuotaCheck::Allowed);
        assert_eq!(quotas.check(RateLimitPolicy::Global, "key-a"), QuotaCheck::Allowed);
        assert_eq!(quotas.tracked_keys(), 3);
    }
}
