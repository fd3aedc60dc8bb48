//! Cloud Tools
//!
//! API clients the scan engine talks through. Credentials stay inside the
//! clients; callers only see typed results.

pub mod aws;

pub use aws::AwsClient;
