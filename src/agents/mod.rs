//! Agents
//!
//! Each agent owns one workflow on top of the cloud tools.

pub mod compliance_scan;
