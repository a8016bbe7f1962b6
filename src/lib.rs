//! Scanner Core Library
//!
//! Post-processing for a recorded website scan: which requests and cookies
//! belong to third parties, which of those are trackers, which organizations
//! own them, and whether the site's privacy policy names those organizations.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`domain`] - Public-suffix-aware domain parsing
//! - [`trace`] - Request and cookie records of a scan
//! - [`store`] - Result store abstraction and in-memory result document
//! - [`dns`] - CNAME lookups (system resolver and static table)
//! - [`classify`] - Third-party classification and CNAME cloaking detection
//! - [`tracker`] - Filter-list engine and tracker detection
//! - [`attribution`] - Organization attribution (homepage list, per-domain records)
//! - [`discovery`] - Privacy policy and imprint link discovery
//! - [`reconcile`] - Policy mention cross-check
//! - [`datasets`] - Reference dataset loading and refresh
//! - [`pipeline`] - Stage sequencing for one scan

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod attribution;
pub mod classify;
pub mod datasets;
pub mod discovery;
pub mod dns;
pub mod domain;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod trace;
pub mod tracker;
mod user_agent;

// Re-export commonly used types
pub use attribution::{Attribution, AttributionSource, HomepageListSource, TrackerRadarSource};
pub use classify::{ThirdPartyClassifier, ThirdPartySummary};
pub use datasets::{
    DatasetError, DatasetOptions, ReferenceData, RefreshOutcome, ScannerOptions, update_all,
};
pub use discovery::{Candidate, Document, HtmlSnapshotDocument, LinkDiscovery, LinkTarget};
pub use dns::{DnsError, DnsLookup, StaticDnsLookup, SystemDnsLookup};
pub use domain::{DomainError, DomainResolver, ParsedDomain};
pub use pipeline::{Pipeline, ScanInput};
pub use reconcile::MentionIndex;
pub use store::{ResultStore, ScanResult, StoreError};
pub use trace::{CookieRecord, RequestRecord, ScanTrace};
pub use tracker::{FilterError, FilterRules, TrackerDetector, TrackingSummary};
