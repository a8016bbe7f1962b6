//! Configuration file loading for the CLI.
//!
//! The file is a flat list of `key = value` lines: `#` comments, double-quoted
//! strings, `true`/`false`, and non-negative integers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use scanner_core::{DatasetOptions, ScannerOptions};

const APP_DIR: &str = "privacy-scanner";
const CONFIG_FILE: &str = "config.toml";
const SECS_PER_DAY: u64 = 24 * 3600;

/// Values read from the configuration file; unset keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Directory holding every reference dataset.
    pub storage_path: Option<PathBuf>,
    pub public_suffix_url: Option<String>,
    pub public_suffix_max_age_days: Option<u64>,
    pub services_url: Option<String>,
    pub services_max_age_days: Option<u64>,
    pub tracker_radar_url: Option<String>,
    pub tracker_radar_max_age_days: Option<u64>,
    /// Fewer tracker-radar files than this forces a refresh.
    pub tracker_radar_min_files: Option<u64>,
    pub easylist_url_prefix: Option<String>,
    pub easylist_max_age_days: Option<u64>,
    pub uncloak_cnames: Option<bool>,
    pub disable_javascript: Option<bool>,
}

impl FileConfig {
    /// Validates values that parse but make no sense.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("public_suffix_max_age_days", self.public_suffix_max_age_days),
            ("services_max_age_days", self.services_max_age_days),
            ("tracker_radar_max_age_days", self.tracker_radar_max_age_days),
            ("easylist_max_age_days", self.easylist_max_age_days),
        ] {
            if let Some(days) = value
                && !(1..=365).contains(&days)
            {
                bail!("Invalid config value for `{field}`: {days}. Expected range: 1..=365");
            }
        }
        if let Some(min_files) = self.tracker_radar_min_files
            && min_files < 2
        {
            bail!("Invalid config value for `tracker_radar_min_files`: {min_files}. Expected at least 2");
        }
        for (field, value) in [
            ("public_suffix_url", &self.public_suffix_url),
            ("services_url", &self.services_url),
            ("tracker_radar_url", &self.tracker_radar_url),
            ("easylist_url_prefix", &self.easylist_url_prefix),
        ] {
            if let Some(url) = value
                && !(url.starts_with("https://") || url.starts_with("http://"))
            {
                bail!("Invalid config value for `{field}`: '{url}'. Expected an http(s) URL");
            }
        }
        Ok(())
    }

    /// Dataset locations and ages with file values applied over the defaults.
    #[must_use]
    pub fn dataset_options(&self) -> DatasetOptions {
        let storage_path = self.storage_path.clone().unwrap_or_else(default_storage_path);
        let mut options = DatasetOptions::new(storage_path);
        if let Some(url) = &self.public_suffix_url {
            options.public_suffix_url.clone_from(url);
        }
        if let Some(url) = &self.services_url {
            options.services_url.clone_from(url);
        }
        if let Some(url) = &self.tracker_radar_url {
            options.tracker_radar_url.clone_from(url);
        }
        if let Some(prefix) = &self.easylist_url_prefix {
            options.easylist_url_prefix.clone_from(prefix);
        }
        if let Some(days) = self.public_suffix_max_age_days {
            options.public_suffix_max_age = days_to_duration(days);
        }
        if let Some(days) = self.services_max_age_days {
            options.services_max_age = days_to_duration(days);
        }
        if let Some(days) = self.tracker_radar_max_age_days {
            options.tracker_radar_max_age = days_to_duration(days);
        }
        if let Some(days) = self.easylist_max_age_days {
            options.easylist_max_age = days_to_duration(days);
        }
        if let Some(min_files) = self.tracker_radar_min_files {
            options.tracker_radar_min_files = usize::try_from(min_files).unwrap_or(usize::MAX);
        }
        options
    }

    #[must_use]
    pub fn scanner_options(&self) -> ScannerOptions {
        let defaults = ScannerOptions::default();
        ScannerOptions {
            uncloak_cnames: self.uncloak_cnames.unwrap_or(defaults.uncloak_cnames),
            disable_javascript: self.disable_javascript.unwrap_or(defaults.disable_javascript),
        }
    }
}

fn days_to_duration(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path that was consulted, if any could be resolved.
    pub path: Option<PathBuf>,
    pub config: FileConfig,
    pub loaded_from_file: bool,
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/privacy-scanner/config.toml`
/// 2. `$HOME/.config/privacy-scanner/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join(APP_DIR).join(CONFIG_FILE))
}

/// `~/.local/share/privacy-scanner`, or a relative directory without `$HOME`.
#[must_use]
pub fn default_storage_path() -> PathBuf {
    env_var_non_empty_os("HOME").map_or_else(
        || PathBuf::from(".privacy-scanner"),
        |home| PathBuf::from(home).join(".local").join("share").join(APP_DIR),
    )
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = env_var_non_empty_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(raw)
}

/// Loads `explicit` if given (it must exist), else the default path if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(default_path) if default_path.exists() => {
            let config = load_file_config(default_path)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: FileConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_number = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_number}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "storage_path" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.storage_path = Some(expand_home(&parsed));
            }
            "public_suffix_url" => {
                cfg.public_suffix_url = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "services_url" => {
                cfg.services_url = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "tracker_radar_url" => {
                cfg.tracker_radar_url = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "easylist_url_prefix" => {
                cfg.easylist_url_prefix = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "public_suffix_max_age_days" => {
                cfg.public_suffix_max_age_days = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "services_max_age_days" => {
                cfg.services_max_age_days = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "tracker_radar_max_age_days" => {
                cfg.tracker_radar_max_age_days = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "easylist_max_age_days" => {
                cfg.easylist_max_age_days = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "tracker_radar_min_files" => {
                cfg.tracker_radar_min_files = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "uncloak_cnames" => {
                cfg.uncloak_cnames = Some(parse_boolean(value).with_context(invalid)?);
            }
            "disable_javascript" => {
                cfg.disable_javascript = Some(parse_boolean(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_number}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
