//! Multi-Target Tag Compliance Scanning
//!
//! Fans one compliance query out across many AWS accounts and regions,
//! isolates per-target failures, and merges the partial results into a
//! single score.
//!
//! ## Architecture
//!
//! - **Federated Identity**: STS AssumeRole per account, cached with single-flight refresh
//! - **Client Pool**: one signed client per (account, region), reused across scans
//! - **Target Discovery**: configured accounts x enabled regions, with a degraded fallback
//! - **Orchestrator**: bounded fan-out with a per-target time budget
//! - **Aggregator**: pure merge of tagged partial results
//! - **Result Cache**: keyed by target identity, pluggable backend
//!
//! ## Security
//!
//! The engine never stores long-lived keys for target accounts. Base
//! credentials come from the environment or web identity; everything else
//! is a short-lived assumed-role session.

mod aggregator;
mod cache;
mod discovery;
mod identity;
mod orchestrator;
mod params;
mod policy;
mod pool;
mod service;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::*;
pub use cache::*;
pub use discovery::*;
pub use identity::*;
pub use orchestrator::*;
pub use params::*;
pub use policy::*;
pub use pool::*;
pub use service::*;
pub use types::*;
