//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Third-party and tracker attribution for captured website scans.
///
/// Classifies the requests and cookies of a recorded page load, flags
/// trackers, attributes third parties to organizations, and checks which of
/// them the site's privacy policy names.
#[derive(Parser, Debug)]
#[command(name = "privacy-scanner")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/privacy-scanner/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Refresh reference datasets older than their max age
    UpdateDatasets {
        /// Refresh every dataset regardless of age
        #[arg(long)]
        force: bool,
    },

    /// Analyse a recorded scan
    Scan(ScanArgs),
}

#[derive(clap::Args, Debug)]
pub struct ScanArgs {
    /// Scan trace JSON: {site_url, final_url, requests, cookies}
    #[arg(long, value_name = "FILE")]
    pub trace: PathBuf,

    /// Extracted privacy policy text
    #[arg(long, value_name = "FILE")]
    pub policy: Option<PathBuf>,

    /// Saved page HTML for privacy policy and imprint link discovery
    #[arg(long, value_name = "FILE")]
    pub html: Option<PathBuf>,

    /// Write the result document here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Skip DNS lookups; no CNAME cloaking is detected
    #[arg(long)]
    pub offline: bool,
}
