//! Best-effort signature matching over request paths, query strings, form
//! fields and client signatures.
//!
//! This is substring and regex matching, not a parser. False negatives are
//! accepted in exchange for a per-request cost that stays negligible.
//! Detections never carry the tainted value, only where it was found and
//! which signature matched.

use std::sync::LazyLock;

use regex::Regex;

use crate::security_events::{SecurityEventType, Severity};

/// Directory traversal, inline script, event-handler and shell/SQL
/// meta-sequences. Matched case-insensitively against the raw and
/// lightly-normalized input.
const URL_MARKERS: &[(&str, &str)] = &[
    ("../", "path_traversal"),
    ("..\\", "path_traversal"),
    ("%2e%2e", "path_traversal_encoded"),
    ("..%2f", "path_traversal_encoded"),
    ("/etc/passwd", "sensitive_file"),
    ("/proc/self", "sensitive_file"),
    ("win.ini", "sensitive_file"),
    ("<script", "script_tag"),
    ("%3cscript", "script_tag_encoded"),
    ("javascript:", "javascript_uri"),
    ("vbscript:", "javascript_uri"),
    ("onerror=", "event_handler"),
    ("onload=", "event_handler"),
    ("onmouseover=", "event_handler"),
    ("onfocus=", "event_handler"),
    ("document.cookie", "cookie_access"),
    ("$(", "shell_substitution"),
    ("${", "shell_substitution"),
    (";--", "sql_comment"),
    ("'--", "sql_comment"),
    ("xp_cmdshell", "sql_procedure"),
    ("@@version", "sql_probe"),
    ("cmd.exe", "shell_binary"),
    ("/bin/sh", "shell_binary"),
];

const XSS_FIELD_MARKERS: &[(&str, &str)] = &[
    ("<script", "script_tag"),
    ("</script", "script_tag"),
    ("javascript:", "javascript_uri"),
    ("vbscript:", "javascript_uri"),
    ("<iframe", "iframe_tag"),
    ("<object", "object_tag"),
    ("<embed", "embed_tag"),
    ("document.cookie", "cookie_access"),
    ("srcdoc=", "srcdoc_attribute"),
];

static EVENT_HANDLER_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<[^>]*\bon[a-z]+\s*=").expect("valid event handler regex")
});

static SQL_SIGNATURES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bunion\b(\s+all)?\s+select\b", "union_select"),
        (r"(?i)\bdrop\s+(table|database)\b", "drop_table"),
        (r"(?i)\binsert\s+into\b", "insert_into"),
        (r"(?i)\bdelete\s+from\b", "delete_from"),
        (r"(?i)\bexec(ute)?\s*(\(|\s+(xp_|sp_))", "exec_call"),
        (
            r#"(?i)['"]\s*\b(or|and)\b\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
            "quoted_tautology",
        ),
        (r"(?i)\b(or|and)\s+(\d+)\s*=\s*(\d+)\b", "numeric_tautology"),
        // A closing quote followed by a comment that swallows the rest of the
        // statement, or that is followed by more SQL.
        (
            r#"(?i)['"]\s*\)?\s*(--|#|/\*)\s*($|\b(select|union|drop|insert|delete|update|or|and)\b)"#,
            "quote_comment",
        ),
        (
            r"(?i);\s*(drop\s+(table|database)|delete\s+from|update\s+\w+\s+set|insert\s+into|shutdown\b)",
            "stacked_query",
        ),
        (r"(?i)\bsleep\s*\(\s*\d+\s*\)|\bbenchmark\s*\(", "time_based"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("valid sql signature"), label))
    .collect()
});

/// Scanner and attack-tool names. Their presence is a strong bot signal.
const SCANNER_MARKERS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "zgrab",
    "nuclei",
    "dirbuster",
    "gobuster",
    "wpscan",
    "acunetix",
    "nessus",
    "havij",
    "w3af",
    "openvas",
    "burpsuite",
    "metasploit",
];

/// Generic HTTP client libraries and crawlers. Often legitimate automation.
const AUTOMATION_MARKERS: &[&str] = &[
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "go-http-client",
    "java/",
    "okhttp",
    "libwww-perl",
    "httpclient",
    "scrapy",
    "headlesschrome",
    "phantomjs",
    "node-fetch",
    "axios/",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionLocation {
    Path,
    Query { param: String },
    Field { name: String },
}

impl DetectionLocation {
    pub fn as_label(&self) -> String {
        match self {
            DetectionLocation::Path => "path".to_string(),
            DetectionLocation::Query { param } => format!("query:{}", truncate_name(param)),
            DetectionLocation::Field { name } => format!("field:{}", truncate_name(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub location: DetectionLocation,
    pub signature: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Missing,
    Scanner(&'static str),
    Automation(&'static str),
}

impl SignatureVerdict {
    pub fn severity(self) -> Severity {
        match self {
            SignatureVerdict::Missing | SignatureVerdict::Scanner(_) => Severity::High,
            SignatureVerdict::Automation(_) => Severity::Medium,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            SignatureVerdict::Missing => "missing",
            SignatureVerdict::Scanner(marker) | SignatureVerdict::Automation(marker) => marker,
        }
    }
}

/// Scan the path and decoded query parameters. Every hit is reported as a
/// `MaliciousUrlPattern`; at most one detection per location.
pub fn inspect_url(path: &str, query: &[(String, String)]) -> Vec<Detection> {
    let mut detections = Vec::new();

    if let Some(signature) = match_url_markers(path) {
        detections.push(url_detection(DetectionLocation::Path, signature));
    }

    for (param, value) in query {
        let signature = match_url_markers(param)
            .or_else(|| match_url_markers(value))
            .or_else(|| match_sql(value));
        if let Some(signature) = signature {
            detections.push(url_detection(
                DetectionLocation::Query {
                    param: param.clone(),
                },
                signature,
            ));
        }
    }

    detections
}

/// Scan form-encoded fields for script injection and SQL injection.
pub fn inspect_fields(fields: &[(String, String)]) -> Vec<Detection> {
    let mut detections = Vec::new();

    for (name, value) in fields {
        let location = DetectionLocation::Field { name: name.clone() };
        if let Some(signature) = match_xss(value) {
            detections.push(Detection {
                event_type: SecurityEventType::XssAttempt,
                severity: Severity::High,
                location,
                signature,
            });
            continue;
        }
        if let Some(signature) = match_sql(value) {
            detections.push(Detection {
                event_type: SecurityEventType::SqlInjectionAttempt,
                severity: Severity::High,
                location,
                signature,
            });
        }
    }

    detections
}

/// Classify a client-signature string. `None` means nothing suspicious.
pub fn inspect_signature(signature: Option<&str>) -> Option<SignatureVerdict> {
    let signature = match signature.map(str::trim) {
        None | Some("") => return Some(SignatureVerdict::Missing),
        Some(value) => value.to_ascii_lowercase(),
    };

    if let Some(marker) = SCANNER_MARKERS
        .iter()
        .find(|marker| signature.contains(*marker))
    {
        return Some(SignatureVerdict::Scanner(*marker));
    }
    AUTOMATION_MARKERS
        .iter()
        .find(|marker| signature.contains(*marker))
        .map(|marker| SignatureVerdict::Automation(*marker))
}

fn url_detection(location: DetectionLocation, signature: &'static str) -> Detection {
    Detection {
        event_type: SecurityEventType::MaliciousUrlPattern,
        severity: Severity::High,
        location,
        signature,
    }
}

fn match_url_markers(input: &str) -> Option<&'static str> {
    let lowered = input.to_ascii_lowercase();
    URL_MARKERS
        .iter()
        .find(|(marker, _)| lowered.contains(marker))
        .map(|(_, label)| *label)
}

fn match_xss(input: &str) -> Option<&'static str> {
    let lowered = input.to_ascii_lowercase();
    if let Some((_, label)) = XSS_FIELD_MARKERS
        .iter()
        .find(|(marker, _)| lowered.contains(marker))
    {
        return Some(*label);
    }
    EVENT_HANDLER_ATTR
        .is_match(input)
        .then_some("event_handler")
}

fn match_sql(input: &str) -> Option<&'static str> {
    SQL_SIGNATURES
        .iter()
        .find(|(pattern, _)| pattern.is_match(input))
        .map(|(_, label)| *label)
}

fn truncate_name(name: &str) -> String {
    name.chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '[' | ']'))
        .take(64)
        .collect()
}
