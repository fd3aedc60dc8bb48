//! Tag Compliance Engine
//!
//! Scans AWS accounts and regions for required-tag compliance. Target
//! accounts are reached through short-lived assumed-role sessions; results
//! are merged into one score and cached per target set.

pub mod agents;
pub mod config;
pub mod tools;
