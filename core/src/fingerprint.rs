use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// Hex characters kept from the composite digest.
pub const COMPOSITE_KEY_LEN: usize = 32;
/// Hex characters kept from the client-signature digest.
pub const SIGNATURE_HASH_LEN: usize = 16;

const ANONYMOUS_FACTOR: &str = "anonymous";

/// Opaque, fixed-length identifier for "who" is making a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity factors observed on a single request. Every factor is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintFactors<'a> {
    pub identity: Option<&'a str>,
    pub client_addr: Option<IpAddr>,
    pub session_id: Option<&'a str>,
    pub client_signature: Option<&'a str>,
}

/// Compose the partition key for a request.
///
/// Factors are labelled and fed to SHA-256 in priority order
/// (identity, address, session, signature hash, network segment), each
/// length-prefixed so caller-controlled values cannot forge a boundary, and
/// the digest is truncated. Absent factors are omitted, so an
/// anonymous sessionless client degrades to an address-only key and a request
/// with no factors at all still yields the stable "anonymous" key.
pub fn compose_key(factors: &FingerprintFactors<'_>) -> CompositeKey {
    let mut labelled: Vec<String> = Vec::with_capacity(5);

    if let Some(identity) = non_empty(factors.identity) {
        labelled.push(format!("user:{identity}"));
    }
    if let Some(addr) = factors.client_addr {
        labelled.push(format!("ip:{addr}"));
    }
    if let Some(session) = non_empty(factors.session_id) {
        labelled.push(format!("session:{session}"));
    }
    if let Some(signature) = non_empty(factors.client_signature) {
        labelled.push(format!("sig:{}", signature_hash(signature)));
    }
    if let Some(addr) = factors.client_addr {
        labelled.push(format!("net:{}", network_segment(addr)));
    }

    if labelled.is_empty() {
        labelled.push(ANONYMOUS_FACTOR.to_string());
    }

    let mut hasher = Sha256::new();
    for factor in &labelled {
        hasher.update((factor.len() as u64).to_be_bytes());
        hasher.update(factor.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    CompositeKey(digest[..COMPOSITE_KEY_LEN].to_string())
}

/// Short, stable fingerprint of a raw client-signature string.
pub fn signature_hash(signature: &str) -> String {
    let digest = sha256_hex(signature.trim());
    digest[..SIGNATURE_HASH_LEN].to_string()
}

/// Subnet of an address with the host portion zeroed: IPv4 /24, IPv6 /64.
pub fn network_segment(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return network_segment(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            let prefix = std::net::Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                0,
                0,
                0,
                0,
            );
            format!("{prefix}/64")
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addr(value: &str) -> IpAddr {
        value.parse().expect("valid ip")
    }

    #[test]
    fn compose_key_is_deterministic_for_identical_factors() {
        let factors = FingerprintFactors {
            identity: Some("user-42"),
            client_addr: Some(addr("203.0.113.5")),
            session_id: Some("sess-abc"),
            client_signature: Some("Mozilla/5.0"),
        };
        assert_eq!(compose_key(&factors), compose_key(&factors));
        assert_eq!(compose_key(&factors).as_str().len(), COMPOSITE_KEY_LEN);
    }

    #[test]
    fn compose_key_without_factors_is_stable_anonymous_key() {
        let first = compose_key(&FingerprintFactors::default());
        let second = compose_key(&FingerprintFactors::default());
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), COMPOSITE_KEY_LEN);
    }

    #[test]
    fn blank_factors_are_treated_as_absent() {
        let with_blank = FingerprintFactors {
            identity: Some("   "),
            client_addr: Some(addr("198.51.100.7")),
            session_id: Some(""),
            client_signature: None,
        };
        let address_only = FingerprintFactors {
            client_addr: Some(addr("198.51.100.7")),
            ..Default::default()
        };
        assert_eq!(compose_key(&with_blank), compose_key(&address_only));
    }

    #[test]
    fn each_factor_changes_the_key() {
        let base = FingerprintFactors {
            identity: Some("user-1"),
            client_addr: Some(addr("203.0.113.5")),
            session_id: Some("s1"),
            client_signature: Some("Mozilla/5.0"),
        };
        let base_key = compose_key(&base);
        let variants = [
            FingerprintFactors { identity: Some("user-2"), ..base },
            FingerprintFactors { client_addr: Some(addr("203.0.113.6")), ..base },
            FingerprintFactors { session_id: Some("s2"), ..base },
            FingerprintFactors { client_signature: Some("curl/8.0"), ..base },
        ];
        for variant in variants {
            assert_ne!(compose_key(&variant), base_key);
        }
    }

    #[test]
    fn ten_thousand_distinct_inputs_do_not_collide() {
        let mut seen = HashSet::new();
        for i in 0..10_000u32 {
            let octets = i.to_be_bytes();
            let identity = format!("user-{}", i % 97);
            let session = format!("session-{i}");
            let factors = FingerprintFactors {
                identity: Some(&identity),
                client_addr: Some(IpAddr::V4(Ipv4Addr::new(10, octets[1], octets[2], octets[3]))),
                session_id: Some(&session),
                client_signature: Some("Mozilla/5.0"),
            };
            assert!(seen.insert(compose_key(&factors)), "collision at input {i}");
        }
    }

    #[test]
    fn identity_cannot_impersonate_other_factors() {
        let genuine = FingerprintFactors {
            identity: Some("alice"),
            client_addr: Some(addr("203.0.113.5")),
            ..Default::default()
        };
        let forged = FingerprintFactors {
            identity: Some("alice|ip:203.0.113.5|net:203.0.113.0/24"),
            ..Default::default()
        };
        assert_ne!(compose_key(&genuine), compose_key(&forged));
    }

    #[test]
    fn network_segment_zeroes_host_portion() {
        assert_eq!(network_segment(addr("203.0.113.5")), "203.0.113.0/24");
        assert_eq!(
            network_segment(addr("2001:db8:85a3:1:8a2e:370:7334:1")),
            "2001:db8:85a3:1::/64"
        );
        assert_eq!(
            network_segment(IpAddr::V6(Ipv4Addr::new(192, 0, 2, 33).to_ipv6_mapped())),
            "192.0.2.0/24"
        );
        assert_eq!(network_segment(IpAddr::V6(Ipv6Addr::LOCALHOST)), "::/64");
    }

    #[test]
    fn signature_hash_is_short_and_trimmed() {
        let hash = signature_hash("  sqlmap/1.0 ");
        assert_eq!(hash.len(), SIGNATURE_HASH_LEN);
        assert_eq!(hash, signature_hash("sqlmap/1.0"));
    }
}
