//! "Update if older than max-age" maintenance for every reference dataset.
//!
//! Downloads land in a temporary file or directory first and only replace
//! the live dataset once they are complete and valid, so a failed refresh
//! can be re-run safely.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::error::DatasetError;
use super::{CANARY_FILE, DatasetOptions};
use crate::attribution::normalize_services;
use crate::domain::DomainResolver;
use crate::tracker::DEFAULT_FILTER_LISTS;
use crate::user_agent;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const READ_TIMEOUT_SECS: u64 = 300;

/// A refresh extracting fewer files than this failed.
const MIN_EXTRACTED_RECORDS: usize = 2;

/// What a single refresh hook did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The dataset was downloaded and replaced.
    Updated,
    /// The dataset is younger than its max age; nothing was fetched.
    Fresh,
}

/// Whether `path` is missing or was last modified more than `max_age` ago.
#[must_use]
pub fn file_is_outdated(path: &Path, max_age: Duration) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|meta| meta.modified()) else {
        return true;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > max_age,
        // mtime in the future
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
struct DatasetClient {
    client: Client,
}

impl DatasetClient {
    fn new() -> Result<Self, DatasetError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true)
            .user_agent(user_agent::dataset_user_agent())
            .build()
            .map_err(DatasetError::Client)?;
        Ok(Self { client })
    }

    /// Downloads `url` into memory, verifying the SHA-256 when one is configured.
    #[instrument(skip(self, expected_sha256))]
    async fn fetch(&self, url: &str, expected_sha256: Option<&str>) -> Result<Vec<u8>, DatasetError> {
        let network = |source| DatasetError::Network {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(network)?;
        if !response.status().is_success() {
            return Err(DatasetError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut hasher = Sha256::new();
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(network)?;
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        if let Some(expected) = expected_sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DatasetError::HashMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        debug!(bytes = body.len(), "download complete");
        Ok(body)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DatasetError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DatasetError::io(parent, e))?;
    }
    let partial = sibling(path, ".part");
    tokio::fs::write(&partial, bytes)
        .await
        .map_err(|e| DatasetError::io(&partial, e))?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| DatasetError::io(path, e))
}

async fn update_public_suffix(
    client: &DatasetClient,
    options: &DatasetOptions,
    force: bool,
) -> Result<RefreshOutcome, DatasetError> {
    let path = options.public_suffix_path();
    if !force && !file_is_outdated(&path, options.public_suffix_max_age) {
        return Ok(RefreshOutcome::Fresh);
    }
    let url = &options.public_suffix_url;
    let bytes = client.fetch(url, options.checksum_for(url)).await?;
    DomainResolver::from_list_str(&String::from_utf8_lossy(&bytes))?;
    write_atomic(&path, &bytes).await?;
    Ok(RefreshOutcome::Updated)
}

async fn update_services(
    client: &DatasetClient,
    options: &DatasetOptions,
    force: bool,
) -> Result<RefreshOutcome, DatasetError> {
    let path = options.services_path();
    if !force && !file_is_outdated(&path, options.services_max_age) {
        return Ok(RefreshOutcome::Fresh);
    }
    let url = &options.services_url;
    let bytes = client.fetch(url, options.checksum_for(url)).await?;
    let json_error = |source| DatasetError::Json {
        what: url.clone(),
        source,
    };
    let mut document: Value = serde_json::from_slice(&bytes).map_err(json_error)?;
    normalize_services(&mut document);
    let normalized = serde_json::to_vec(&document).map_err(json_error)?;
    write_atomic(&path, &normalized).await?;
    Ok(RefreshOutcome::Updated)
}

async fn update_easylists(
    client: &DatasetClient,
    options: &DatasetOptions,
    force: bool,
) -> Result<RefreshOutcome, DatasetError> {
    let mut outcome = RefreshOutcome::Fresh;
    let dir = options.easylist_dir();
    for name in DEFAULT_FILTER_LISTS {
        let path = dir.join(name);
        if !force && !file_is_outdated(&path, options.easylist_max_age) {
            continue;
        }
        let url = format!("{}{name}", options.easylist_url_prefix);
        let bytes = client.fetch(&url, options.checksum_for(&url)).await?;
        write_atomic(&path, &bytes).await?;
        outcome = RefreshOutcome::Updated;
    }
    Ok(outcome)
}

async fn count_entries(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(_)) = entries.next_entry().await {
        count += 1;
    }
    count
}

/// Maps an archive member path to its flattened name under `domains/`.
///
/// Members outside `<root>/domains/` yield `None`; parent or absolute
/// components are an error.
fn domains_member_name(member: &Path) -> Result<Option<String>, String> {
    let mut components = Vec::new();
    for component in member.components() {
        match component {
            Component::Normal(part) => components.push(part),
            Component::CurDir => {}
            _ => return Err(format!("illegal path {}", member.display())),
        }
    }
    if components.len() < 3 || components[1] != "domains" {
        return Ok(None);
    }
    Ok(components
        .last()
        .and_then(|name| name.to_str())
        .map(str::to_string))
}

/// Unpacks the `domains/` records of a gzip'd tarball into `target`.
fn extract_domains(archive: &[u8], target: &Path) -> Result<usize, String> {
    let decoder = flate2::read::GzDecoder::new(archive);
    let mut tarball = tar::Archive::new(decoder);
    let mut extracted = 0;
    for entry in tarball.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry.path().map_err(|e| e.to_string())?.into_owned();
        let Some(name) = domains_member_name(&member)? else {
            continue;
        };
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|e| e.to_string())?;
        std::fs::write(target.join(&name), contents).map_err(|e| format!("{name}: {e}"))?;
        extracted += 1;
    }
    Ok(extracted)
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), DatasetError> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(DatasetError::io(dir, e)),
        _ => Ok(()),
    }
}

async fn update_tracker_radar(
    client: &DatasetClient,
    options: &DatasetOptions,
    force: bool,
) -> Result<RefreshOutcome, DatasetError> {
    let target = options.tracker_radar_dir();
    if !force
        && !file_is_outdated(&target.join(CANARY_FILE), options.tracker_radar_max_age)
        && count_entries(&target).await > options.tracker_radar_min_files
    {
        return Ok(RefreshOutcome::Fresh);
    }

    let url = options.tracker_radar_url.clone();
    let archive = client.fetch(&url, options.checksum_for(&url)).await?;

    let staging = sibling(&target, ".tmp");
    remove_dir_if_exists(&staging).await?;
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| DatasetError::io(&staging, e))?;

    let extract_into = staging.clone();
    let extracted = tokio::task::spawn_blocking(move || extract_domains(&archive, &extract_into))
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| result);
    let extracted = match extracted {
        Ok(count) if count >= MIN_EXTRACTED_RECORDS => count,
        Ok(count) => {
            remove_dir_if_exists(&staging).await?;
            return Err(DatasetError::Archive {
                url,
                reason: format!("only {count} domain records extracted"),
            });
        }
        Err(reason) => {
            remove_dir_if_exists(&staging).await?;
            return Err(DatasetError::Archive { url, reason });
        }
    };

    let canary = staging.join(CANARY_FILE);
    tokio::fs::write(&canary, b"")
        .await
        .map_err(|e| DatasetError::io(&canary, e))?;

    let retired = sibling(&target, ".old");
    remove_dir_if_exists(&retired).await?;
    if tokio::fs::metadata(&target).await.is_ok() {
        tokio::fs::rename(&target, &retired)
            .await
            .map_err(|e| DatasetError::io(&target, e))?;
    }
    tokio::fs::rename(&staging, &target)
        .await
        .map_err(|e| DatasetError::io(&target, e))?;
    if let Err(err) = remove_dir_if_exists(&retired).await {
        warn!(error = %err, "could not remove retired tracker-radar directory");
    }
    info!(records = extracted, "tracker-radar records replaced");
    Ok(RefreshOutcome::Updated)
}

/// Runs every refresh hook in turn; `force` ignores the max ages.
///
/// Returns each dataset's name with its outcome.
///
/// # Errors
///
/// Returns the first [`DatasetError`]; datasets refreshed before it stay updated.
#[instrument(skip(options), fields(storage = %options.storage_path.display()))]
pub async fn update_all(
    options: &DatasetOptions,
    force: bool,
) -> Result<Vec<(&'static str, RefreshOutcome)>, DatasetError> {
    tokio::fs::create_dir_all(&options.storage_path)
        .await
        .map_err(|e| DatasetError::io(&options.storage_path, e))?;
    let client = DatasetClient::new()?;

    let outcomes = vec![
        ("public_suffix", update_public_suffix(&client, options, force).await?),
        ("disconnectme", update_services(&client, options, force).await?),
        ("easylist", update_easylists(&client, options, force).await?),
        ("tracker_radar", update_tracker_radar(&client, options, force).await?),
    ];
    for (dataset, outcome) in &outcomes {
        info!(dataset, ?outcome, "dataset checked");
    }
    Ok(outcomes)
}
