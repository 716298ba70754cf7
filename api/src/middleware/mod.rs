pub mod cors;
pub mod mitigation;
pub mod security_headers;
