//! Reference datasets: on-disk layout, load-once context, and refresh.
//!
//! Every scan reads the same process-wide datasets (public suffix list,
//! filter lists, homepage list, tracker-radar records). [`ReferenceData`]
//! loads each of them at most once, on first use, and hands out shared
//! references afterwards. Refreshing is a separate maintenance operation
//! ([`update_all`]) that never runs during a scan.
//!
//! # Layout under `storage_path`
//!
//! | path | dataset |
//! |---|---|
//! | `public_suffix_list.dat` | public suffix list |
//! | `disconnect-tp-services.json` | homepage list (normalised) |
//! | `easylist/*.txt` | filter lists |
//! | `tracker-radar/*.json` | per-domain ownership records (+ `canary`) |

mod error;
mod refresh;

pub use error::DatasetError;
pub use refresh::{RefreshOutcome, file_is_outdated, update_all};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{info, instrument};

use crate::attribution::{HomepageListSource, ServicesList, TrackerRadarSource};
use crate::domain::DomainResolver;
use crate::tracker::{DEFAULT_FILTER_LISTS, FilterRules};

const DAY: Duration = Duration::from_secs(24 * 3600);

pub const PUBLIC_SUFFIX_FILE: &str = "public_suffix_list.dat";
pub const SERVICES_FILE: &str = "disconnect-tp-services.json";
pub const EASYLIST_DIR: &str = "easylist";
pub const TRACKER_RADAR_DIR: &str = "tracker-radar";
pub const CANARY_FILE: &str = "canary";

pub const DEFAULT_PUBLIC_SUFFIX_URL: &str = "https://publicsuffix.org/list/public_suffix_list.dat";
pub const DEFAULT_SERVICES_URL: &str =
    "https://github.com/disconnectme/disconnect-tracking-protection/raw/master/services.json";
pub const DEFAULT_TRACKER_RADAR_URL: &str =
    "https://github.com/duckduckgo/tracker-radar/archive/master.tar.gz";
pub const DEFAULT_EASYLIST_URL_PREFIX: &str = "https://easylist.to/easylist/";
pub const DEFAULT_TRACKER_RADAR_MIN_FILES: usize = 10_000;

/// Where datasets live and where and how often they are refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOptions {
    pub storage_path: PathBuf,
    pub public_suffix_url: String,
    pub public_suffix_max_age: Duration,
    pub services_url: String,
    pub services_max_age: Duration,
    pub tracker_radar_url: String,
    pub tracker_radar_max_age: Duration,
    /// The tracker-radar directory is stale when it holds fewer files.
    pub tracker_radar_min_files: usize,
    pub easylist_url_prefix: String,
    pub easylist_max_age: Duration,
    /// Expected SHA-256 (lower-case hex) per download URL.
    pub checksums: HashMap<String, String>,
}

impl DatasetOptions {
    /// Default URLs and ages for datasets stored under `storage_path`.
    #[must_use]
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            public_suffix_url: DEFAULT_PUBLIC_SUFFIX_URL.to_string(),
            public_suffix_max_age: 14 * DAY,
            services_url: DEFAULT_SERVICES_URL.to_string(),
            services_max_age: 7 * DAY,
            tracker_radar_url: DEFAULT_TRACKER_RADAR_URL.to_string(),
            tracker_radar_max_age: 7 * DAY,
            tracker_radar_min_files: DEFAULT_TRACKER_RADAR_MIN_FILES,
            easylist_url_prefix: DEFAULT_EASYLIST_URL_PREFIX.to_string(),
            easylist_max_age: 7 * DAY,
            checksums: HashMap::new(),
        }
    }

    #[must_use]
    pub fn public_suffix_path(&self) -> PathBuf {
        self.storage_path.join(PUBLIC_SUFFIX_FILE)
    }

    #[must_use]
    pub fn services_path(&self) -> PathBuf {
        self.storage_path.join(SERVICES_FILE)
    }

    #[must_use]
    pub fn easylist_dir(&self) -> PathBuf {
        self.storage_path.join(EASYLIST_DIR)
    }

    #[must_use]
    pub fn easylist_paths(&self) -> Vec<PathBuf> {
        let dir = self.easylist_dir();
        DEFAULT_FILTER_LISTS.iter().map(|name| dir.join(name)).collect()
    }

    #[must_use]
    pub fn tracker_radar_dir(&self) -> PathBuf {
        self.storage_path.join(TRACKER_RADAR_DIR)
    }

    fn checksum_for(&self, url: &str) -> Option<&str> {
        self.checksums.get(url).map(String::as_str)
    }
}

/// Per-scan behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerOptions {
    /// Match the CNAME target of first-party-looking requests against filter lists.
    pub uncloak_cnames: bool,
    /// The page already runs with scripts disabled.
    pub disable_javascript: bool,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            uncloak_cnames: true,
            disable_javascript: false,
        }
    }
}

/// Process-wide reference datasets, each loaded at most once.
#[derive(Debug)]
pub struct ReferenceData {
    options: DatasetOptions,
    domains: OnceCell<DomainResolver>,
    filter_rules: OnceCell<FilterRules>,
    homepage_list: OnceCell<HomepageListSource>,
    tracker_radar: OnceCell<TrackerRadarSource>,
}

fn read_to_string(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|e| DatasetError::read(path, e))
}

impl ReferenceData {
    #[must_use]
    pub fn new(options: DatasetOptions) -> Self {
        Self {
            options,
            domains: OnceCell::new(),
            filter_rules: OnceCell::new(),
            homepage_list: OnceCell::new(),
            tracker_radar: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Public-suffix-aware resolver.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] if the list is missing or invalid.
    #[instrument(skip(self))]
    pub fn domains(&self) -> Result<&DomainResolver, DatasetError> {
        self.domains.get_or_try_init(|| {
            let path = self.options.public_suffix_path();
            let resolver = DomainResolver::from_list_str(&read_to_string(&path)?)?;
            info!(path = %path.display(), "public suffix list loaded");
            Ok(resolver)
        })
    }

    /// Filter rules from every default list.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] if a list file cannot be read.
    #[instrument(skip(self))]
    pub fn filter_rules(&self) -> Result<&FilterRules, DatasetError> {
        self.filter_rules
            .get_or_try_init(|| Ok(FilterRules::load_files(&self.options.easylist_paths())?))
    }

    /// Homepage-list attribution source.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] if the services file is missing or not JSON.
    #[instrument(skip(self))]
    pub fn homepage_list(&self) -> Result<&HomepageListSource, DatasetError> {
        self.homepage_list.get_or_try_init(|| {
            let path = self.options.services_path();
            let list = ServicesList::from_json_str(&read_to_string(&path)?).map_err(|source| {
                DatasetError::Json {
                    what: path.display().to_string(),
                    source,
                }
            })?;
            info!(path = %path.display(), "homepage list loaded");
            Ok(HomepageListSource::new(list))
        })
    }

    /// Per-domain record source; records are read lazily per lookup.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Missing`] if the record directory does not exist.
    pub fn tracker_radar(&self) -> Result<&TrackerRadarSource, DatasetError> {
        self.tracker_radar.get_or_try_init(|| {
            let dir = self.options.tracker_radar_dir();
            if !dir.is_dir() {
                return Err(DatasetError::Missing { path: dir });
            }
            Ok(TrackerRadarSource::new(dir))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = DatasetOptions::new("/data");
        assert_eq!(options.public_suffix_max_age, Duration::from_secs(14 * 24 * 3600));
        assert_eq!(options.services_max_age, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(options.tracker_radar_min_files, 10_000);
        assert_eq!(options.easylist_paths().len(), 3);
        assert_eq!(options.tracker_radar_dir(), PathBuf::from("/data/tracker-radar"));
        assert!(ScannerOptions::default().uncloak_cnames);
    }

    #[test]
    fn test_missing_datasets_report_missing() {
        let dir = tempfile::tempdir().unwrap();
        let data = ReferenceData::new(DatasetOptions::new(dir.path()));
        assert!(matches!(data.domains().unwrap_err(), DatasetError::Missing { .. }));
        assert!(matches!(data.homepage_list().unwrap_err(), DatasetError::Missing { .. }));
        assert!(matches!(data.tracker_radar().unwrap_err(), DatasetError::Missing { .. }));
        assert!(matches!(data.filter_rules().unwrap_err(), DatasetError::Filter(_)));
    }

    #[test]
    fn test_datasets_load_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PUBLIC_SUFFIX_FILE), "// ===BEGIN ICANN DOMAINS===\ncom\nnet\n").unwrap();
        let data = ReferenceData::new(DatasetOptions::new(dir.path()));

        let first: *const DomainResolver = data.domains().unwrap();
        std::fs::remove_file(dir.path().join(PUBLIC_SUFFIX_FILE)).unwrap();
        let second: *const DomainResolver = data.domains().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_services_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SERVICES_FILE), "{").unwrap();
        let data = ReferenceData::new(DatasetOptions::new(dir.path()));
        assert!(matches!(data.homepage_list().unwrap_err(), DatasetError::Json { .. }));
    }
}
