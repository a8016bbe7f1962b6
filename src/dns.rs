//! DNS canonical-name lookups used for CNAME-cloak detection.
//!
//! - [`DnsLookup`] - async trait the classifier depends on
//! - [`SystemDnsLookup`] - `hickory-resolver` backed implementation
//! - [`StaticDnsLookup`] - fixed table, for replaying recorded lookups and tests
//! - [`get_cname`] - fail-open wrapper: every failure becomes "no CNAME"

use std::collections::HashMap;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType as WireRecordType;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Address record type a canonical name is resolved for.
///
/// A CNAME applies to A and AAAA queries alike, so callers normally use `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    fn wire(self) -> WireRecordType {
        match self {
            Self::A => WireRecordType::A,
            Self::Aaaa => WireRecordType::AAAA,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::Aaaa => f.write_str("AAAA"),
        }
    }
}

/// Errors from a DNS lookup.
#[derive(Debug, Error)]
pub enum DnsError {
    /// NXDOMAIN or an empty answer.
    #[error("no {record_type} records for {name}")]
    NoRecords { name: String, record_type: RecordType },

    /// No nameserver could be reached.
    #[error("no nameservers available to resolve {name}")]
    NoNameservers { name: String },

    /// Any other resolver failure (timeouts, protocol errors, ...).
    #[error("could not get {record_type} records for {name}: {reason}")]
    Lookup {
        name: String,
        record_type: RecordType,
        reason: String,
    },
}

impl DnsError {
    /// Whether the failure only means "this name has no CNAME".
    #[must_use]
    pub fn is_negative_answer(&self) -> bool {
        matches!(self, Self::NoRecords { .. } | Self::NoNameservers { .. })
    }
}

/// Resolves the canonical name behind a hostname.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Returns the canonical name for `name`, or `None` when `name` is already canonical.
    async fn canonical_name(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> Result<Option<String>, DnsError>;
}

/// Looks up the CNAME target of `name`, treating every failure as "no CNAME".
///
/// Negative answers are silent; other failures are logged as warnings.
#[instrument(skip(dns), fields(qname = %name, rdtype = %record_type))]
pub async fn get_cname(dns: &dyn DnsLookup, name: &str, record_type: RecordType) -> Option<String> {
    match dns.canonical_name(name, record_type).await {
        Ok(cname) => cname,
        Err(err) if err.is_negative_answer() => {
            debug!(error = %err, "no CNAME");
            None
        }
        Err(err) => {
            warn!(error = %err, "DNS lookup failed; treating as no CNAME");
            None
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// System resolver backed by `hickory-resolver`.
pub struct SystemDnsLookup {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for SystemDnsLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDnsLookup").finish_non_exhaustive()
    }
}

impl SystemDnsLookup {
    /// Uses the host's resolver configuration, falling back to public defaults.
    #[must_use]
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(error = %err, "system DNS configuration unavailable; using default resolvers");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }
}

impl Default for SystemDnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_resolve_error(name: &str, record_type: RecordType, err: &ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NoRecords {
            name: name.to_string(),
            record_type,
        },
        ResolveErrorKind::NoConnections => DnsError::NoNameservers {
            name: name.to_string(),
        },
        _ => DnsError::Lookup {
            name: name.to_string(),
            record_type,
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl DnsLookup for SystemDnsLookup {
    async fn canonical_name(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> Result<Option<String>, DnsError> {
        let queried = normalize_name(name);
        // absolute name so resolv.conf search domains are not appended
        let absolute = format!("{queried}.");
        let lookup = self
            .resolver
            .lookup(absolute.as_str(), record_type.wire())
            .await
            .map_err(|err| classify_resolve_error(&queried, record_type, &err))?;

        let canonical = lookup
            .record_iter()
            .find(|record| record.record_type() == record_type.wire())
            .map(|record| normalize_name(&record.name().to_ascii()));

        match canonical {
            Some(canonical) if canonical != queried => Ok(Some(canonical)),
            Some(_) => Ok(None),
            None => Err(DnsError::NoRecords {
                name: queried,
                record_type,
            }),
        }
    }
}

/// Fixed name -> canonical-name table.
///
/// Names absent from the table answer "no records", which is a negative answer
/// and therefore never logged as a failure.
#[derive(Debug, Clone, Default)]
pub struct StaticDnsLookup {
    cnames: HashMap<String, String>,
    failures: HashMap<String, String>,
}

impl StaticDnsLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `name -> canonical` entry.
    #[must_use]
    pub fn with_cname(mut self, name: &str, canonical: &str) -> Self {
        self.cnames
            .insert(normalize_name(name), normalize_name(canonical));
        self
    }

    /// Makes lookups of `name` fail with a non-negative resolver error.
    #[must_use]
    pub fn with_failure(mut self, name: &str, reason: &str) -> Self {
        self.failures
            .insert(normalize_name(name), reason.to_string());
        self
    }
}

impl FromIterator<(String, String)> for StaticDnsLookup {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |table, (name, canonical)| {
                table.with_cname(&name, &canonical)
            })
    }
}

#[async_trait]
impl DnsLookup for StaticDnsLookup {
    async fn canonical_name(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> Result<Option<String>, DnsError> {
        let name = normalize_name(name);
        if let Some(reason) = self.failures.get(&name) {
            return Err(DnsError::Lookup {
                name,
                record_type,
                reason: reason.clone(),
            });
        }
        match self.cnames.get(&name) {
            Some(canonical) if *canonical != name => Ok(Some(canonical.clone())),
            Some(_) => Ok(None),
            None => Err(DnsError::NoRecords { name, record_type }),
        }
    }
}
