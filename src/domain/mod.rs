//! Monitoring domain: targets, probes and remediation, and their scheduling

pub mod checker;
pub mod scheduler;
pub mod target;
