//! AWS API Tool
//!
//! Minimal signed AWS client used by the scan engine. No SDK: requests are
//! signed with SigV4 and responses parsed with quick-xml / serde_json.
//!
//! ## Services
//!
//! - **STS**: AssumeRole, AssumeRoleWithWebIdentity, GetCallerIdentity
//! - **EC2**: DescribeRegions (target discovery)
//! - **Resource Groups Tagging API**: GetResources (tag compliance)

mod client;
mod credentials;
pub mod ec2;
pub mod sigv4;
pub mod sts;
pub mod tagging;

pub use client::{extract_error, extract_xml_value, AwsClient, AwsError, RetryPolicy};
pub use credentials::{CredentialsSource, StaticCredentials};
