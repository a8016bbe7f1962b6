//! CLI entry point for the privacy scanner.

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use scanner_core::{
    DnsLookup, Document, HtmlSnapshotDocument, Pipeline, ReferenceData, ScanInput, ScanResult,
    ScanTrace, StaticDnsLookup, SystemDnsLookup, update_all,
};
use tracing::{debug, info};

mod app_config;
mod cli;

use app_config::LoadedConfig;
use cli::{Args, Command, ScanArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");
    let loaded = app_config::load_config(args.config.as_deref())?;
    if loaded.loaded_from_file
        && let Some(path) = &loaded.path
    {
        info!(path = %path.display(), "configuration loaded");
    }

    match args.command {
        Command::UpdateDatasets { force } => update_datasets(&loaded, force).await,
        Command::Scan(scan) => run_scan(&loaded, &scan).await,
    }
}

async fn update_datasets(loaded: &LoadedConfig, force: bool) -> Result<()> {
    let options = loaded.config.dataset_options();
    info!(storage = %options.storage_path.display(), force, "refreshing reference datasets");
    let outcomes = update_all(&options, force)
        .await
        .context("Reference dataset refresh failed")?;
    for (dataset, outcome) in outcomes {
        println!("{dataset}: {outcome:?}");
    }
    Ok(())
}

async fn run_scan(loaded: &LoadedConfig, scan: &ScanArgs) -> Result<()> {
    let raw_trace = fs::read_to_string(&scan.trace)
        .with_context(|| format!("Failed to read trace file '{}'", scan.trace.display()))?;
    let trace: ScanTrace = serde_json::from_str(&raw_trace)
        .with_context(|| format!("Invalid trace file '{}'", scan.trace.display()))?;

    let policy_text = scan
        .policy
        .as_ref()
        .map(|path| {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read policy file '{}'", path.display()))
        })
        .transpose()?;
    let document = scan
        .html
        .as_ref()
        .map(|path| {
            fs::read_to_string(path)
                .map(|html| HtmlSnapshotDocument::parse(&html))
                .with_context(|| format!("Failed to read HTML file '{}'", path.display()))
        })
        .transpose()?;

    let data = ReferenceData::new(loaded.config.dataset_options());
    let dns: Box<dyn DnsLookup> = if scan.offline {
        Box::new(StaticDnsLookup::new())
    } else {
        Box::new(SystemDnsLookup::new())
    };
    let pipeline =
        Pipeline::from_reference_data(&data, dns.as_ref(), loaded.config.scanner_options())
            .context("Reference datasets unavailable")?;

    let mut store = ScanResult::for_site(&trace.site_url);
    let mut input = ScanInput {
        trace,
        policy_text,
        document: document.as_ref().map(|doc| doc as &dyn Document),
    };
    pipeline.run(&mut store, &mut input).await;

    let rendered = serde_json::to_string_pretty(&store.to_json())
        .context("Failed to serialize scan result")?;
    match &scan.output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write result file '{}'", path.display()))?;
            info!(path = %path.display(), "scan result written");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
