//! Pure building blocks of the Encore bot-mitigation layer.
//!
//! Nothing in this crate holds state or performs I/O: fingerprinting, policy
//! classification, signature detection and metric derivation are all plain
//! functions of their inputs. The stateful pieces live in `encore-api`.

pub mod error;
pub mod fingerprint;
pub mod policy;
pub mod security_events;
pub mod security_metrics;
pub mod sentinel;
