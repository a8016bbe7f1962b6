//! Per-domain ownership records (DuckDuckGo Tracker Radar `domains/*.json`).

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use tracing::{debug, error, instrument};
use url::Host;

use super::{Attribution, AttributionSource};
use crate::domain::DomainResolver;

/// Lookups kept per source; most fqdns repeat within and across scans.
const RECORD_CACHE_CAPACITY: usize = 50;

/// Owner block of a domain record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecordOwner {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

/// The fields of a Tracker Radar domain file this crate reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DomainRecord {
    #[serde(default)]
    pub owner: Option<RecordOwner>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
}

/// Directory of `<idna-domain>.json` records with an LRU lookup cache.
pub struct TrackerRadarSource {
    dir: PathBuf,
    cache: Mutex<LruCache<String, Option<Arc<DomainRecord>>>>,
}

impl std::fmt::Debug for TrackerRadarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRadarSource")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

/// ASCII (punycode) form of `domain`, as used in record file names.
fn idna_encode(domain: &str) -> Result<String, url::ParseError> {
    match Host::parse(domain)? {
        Host::Domain(ascii) => Ok(ascii),
        other => Ok(other.to_string()),
    }
}

impl TrackerRadarSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(RECORD_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            dir: dir.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record of `fqdn` or its closest ancestor below the public suffix.
    pub async fn load_record(&self, fqdn: &str, domains: &DomainResolver) -> Option<Arc<DomainRecord>> {
        if let Ok(mut cache) = self.cache.lock()
            && let Some(hit) = cache.get(fqdn)
        {
            return hit.clone();
        }

        let record = self.find_record(fqdn, domains).await.map(Arc::new);

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(fqdn.to_string(), record.clone());
        }
        record
    }

    async fn find_record(&self, fqdn: &str, domains: &DomainResolver) -> Option<DomainRecord> {
        for candidate in domains.walk_to_public_suffix(fqdn) {
            let encoded = match idna_encode(&candidate) {
                Ok(encoded) => encoded,
                Err(err) => {
                    error!(fqdn = %candidate, error = %err, "could not IDNA-encode domain");
                    break;
                }
            };
            let path = self.dir.join(format!("{encoded}.json"));
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<DomainRecord>(&bytes) {
                    Ok(record) => return Some(record),
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "malformed tracker-radar record");
                    }
                },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    error!(path = %path.display(), error = %err, "could not open tracker-radar record");
                }
            }
        }
        None
    }
}

#[async_trait]
impl AttributionSource for TrackerRadarSource {
    fn name(&self) -> &'static str {
        "tracker_radar"
    }

    #[instrument(skip_all, fields(source = "tracker_radar", fqdns = fqdns.len()))]
    async fn attribute(&self, fqdns: &[String], domains: &DomainResolver) -> Attribution {
        let mut attribution = Attribution::default();
        for fqdn in fqdns {
            let record = self.load_record(fqdn, domains).await;
            let owner = record
                .as_deref()
                .and_then(|record| record.owner.as_ref())
                .and_then(|owner| owner.name.as_deref().map(|name| (name, owner)));
            match (owner, record.as_deref()) {
                (Some((name, owner)), Some(record)) => {
                    debug!(fqdn = %fqdn, owner = name, "matched tracker-radar record");
                    attribution.record(
                        name,
                        owner.display_name.as_deref(),
                        record.categories.iter().flatten().cloned(),
                        fqdn,
                    );
                }
                _ => attribution.unrecognized(fqdn),
            }
        }
        attribution.finish()
    }
}
