//! Public-suffix-aware domain parsing.
//!
//! [`DomainResolver`] turns URLs and bare hostnames into a [`ParsedDomain`]
//! (`fqdn`, `registered_domain`, `suffix`) and produces the
//! [`SuffixWalk`] used by hierarchical dataset lookups.
//!
//! The resolver never touches the network: the public suffix list is loaded
//! from the reference data directory and refreshed by the dataset
//! maintenance operation (see [`crate::datasets`]).
//!
//! # Example
//!
//! ```
//! use scanner_core::domain::DomainResolver;
//!
//! let resolver = DomainResolver::from_list_str("// ===BEGIN ICANN DOMAINS===\ncom\nco.uk\n").unwrap();
//! let parsed = resolver.parse("https://www.example.co.uk/path?q=1");
//! assert_eq!(parsed.fqdn, "www.example.co.uk");
//! assert_eq!(parsed.registered_domain, "example.co.uk");
//! assert_eq!(parsed.suffix, "co.uk");
//!
//! let walk: Vec<String> = resolver.walk_to_public_suffix("a.b.example.com").collect();
//! assert_eq!(walk, ["a.b.example.com", "b.example.com", "example.com"]);
//! ```

use std::iter::FusedIterator;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use publicsuffix::{List, Psl};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Number of parsed inputs kept in the per-resolver cache.
const PARSE_CACHE_CAPACITY: usize = 4096;

/// Errors raised while building a resolver.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The public suffix list text could not be parsed.
    #[error("invalid public suffix list: {reason}\n  Suggestion: run `privacy-scanner update-datasets --force`")]
    InvalidList {
        /// Parser message.
        reason: String,
    },

    /// The public suffix list contained no rules.
    #[error("public suffix list is empty\n  Suggestion: run `privacy-scanner update-datasets --force`")]
    EmptyList,
}

/// A hostname split along the public suffix boundary.
///
/// `registered_domain` and `suffix` are empty when the host has no known
/// public suffix (IP addresses, `localhost`, unknown TLDs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedDomain {
    /// Lower-cased host without port, credentials, or trailing dot.
    pub fqdn: String,
    /// Public suffix plus one label, e.g. `example.co.uk`.
    pub registered_domain: String,
    /// Public suffix, e.g. `co.uk`.
    pub suffix: String,
}

/// Public-suffix-aware parser with a bounded per-input cache.
pub struct DomainResolver {
    list: List,
    cache: Mutex<LruCache<String, ParsedDomain>>,
}

impl std::fmt::Debug for DomainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainResolver").finish_non_exhaustive()
    }
}

impl DomainResolver {
    /// Creates a resolver over an already parsed public suffix list.
    #[must_use]
    pub fn new(list: List) -> Self {
        let capacity = NonZeroUsize::new(PARSE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            list,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Parses public suffix list text (the `public_suffix_list.dat` format).
    ///
    /// # Errors
    ///
    /// Returns [`DomainError`] when the text is not a valid list or holds no rules.
    pub fn from_list_str(raw: &str) -> Result<Self, DomainError> {
        let list: List = raw.parse().map_err(|e: publicsuffix::Error| DomainError::InvalidList {
            reason: e.to_string(),
        })?;
        if list.is_empty() {
            return Err(DomainError::EmptyList);
        }
        Ok(Self::new(list))
    }

    /// Parses a URL or bare hostname.
    ///
    /// Never fails: malformed input yields a best-effort parse whose
    /// `registered_domain` is empty.
    #[must_use]
    pub fn parse(&self, url_or_host: &str) -> ParsedDomain {
        if let Ok(mut cache) = self.cache.lock()
            && let Some(hit) = cache.get(url_or_host)
        {
            return hit.clone();
        }

        let parsed = self.parse_uncached(url_or_host);
        trace!(input = %url_or_host, fqdn = %parsed.fqdn, registered = %parsed.registered_domain, "parsed domain");

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(url_or_host.to_string(), parsed.clone());
        }
        parsed
    }

    /// Shorthand for `parse(input).registered_domain`.
    #[must_use]
    pub fn registered_domain(&self, url_or_host: &str) -> String {
        self.parse(url_or_host).registered_domain
    }

    /// Yields `fqdn` and then each parent domain, stopping before the public suffix.
    #[must_use]
    pub fn walk_to_public_suffix(&self, fqdn: &str) -> SuffixWalk {
        SuffixWalk::new(fqdn, &self.parse(fqdn).suffix)
    }

    fn parse_uncached(&self, url_or_host: &str) -> ParsedDomain {
        let fqdn = extract_host(url_or_host);
        if fqdn.is_empty() || is_ip_literal(&fqdn) {
            return ParsedDomain {
                fqdn,
                registered_domain: String::new(),
                suffix: String::new(),
            };
        }

        let suffix = self
            .list
            .suffix(fqdn.as_bytes())
            .filter(publicsuffix::Suffix::is_known)
            .map(|s| String::from_utf8_lossy(s.as_bytes()).into_owned())
            .unwrap_or_default();

        let registered_domain = if suffix.is_empty() {
            String::new()
        } else {
            self.list
                .domain(fqdn.as_bytes())
                .map(|d| String::from_utf8_lossy(d.as_bytes()).into_owned())
                .unwrap_or_default()
        };

        ParsedDomain {
            fqdn,
            registered_domain,
            suffix,
        }
    }
}

/// Strips scheme, credentials, path, port and trailing dot from a URL or host.
fn extract_host(input: &str) -> String {
    let trimmed = input.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) if trimmed[..idx].chars().all(is_scheme_char) => &trimmed[idx + 3..],
        _ => trimmed.strip_prefix("//").unwrap_or(trimmed),
    };

    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);

    let host = if let Some(rest) = host_port.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        host_port.split(':').next().unwrap_or_default()
    };

    host.trim_end_matches('.').to_lowercase()
}

fn is_scheme_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok() || host.parse::<Ipv6Addr>().is_ok()
}

/// Lazy walk from an fqdn towards (but excluding) its public suffix.
///
/// Each item has strictly fewer labels than the one before it; the walk is
/// finite and yields nothing more once exhausted.
#[derive(Debug, Clone)]
pub struct SuffixWalk {
    next: Option<String>,
    suffix: String,
}

impl SuffixWalk {
    /// Starts a walk at `fqdn` that stops once the remainder equals `suffix`.
    #[must_use]
    pub fn new(fqdn: &str, suffix: &str) -> Self {
        Self {
            next: Some(fqdn.to_string()),
            suffix: suffix.to_string(),
        }
    }
}

impl Iterator for SuffixWalk {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        if let Some((_, parent)) = current.split_once('.')
            && !parent.is_empty()
            && parent != self.suffix
        {
            self.next = Some(parent.to_string());
        }
        Some(current)
    }
}

impl FusedIterator for SuffixWalk {}
