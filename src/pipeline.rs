//! Stage sequencing for one scan.
//!
//! Stages run strictly in order over a shared [`ResultStore`]; each reads
//! only fields written by earlier stages:
//!
//! 1. final-URL canonical name
//! 2. third-party classification
//! 3. tracker detection
//! 4. attribution, once per registered source
//! 5. privacy-policy and imprint link discovery (when a document is given)
//! 6. policy reconciliation (when policy text is given)

use serde_json::Value;
use tracing::{info, instrument};

use crate::attribution::{AttributionSource, extract_attribution};
use crate::classify::{extract_third_parties, resolve_final_url_cname};
use crate::datasets::{DatasetError, ReferenceData, ScannerOptions};
use crate::discovery::{Document, LinkTarget, extract_link};
use crate::dns::DnsLookup;
use crate::domain::DomainResolver;
use crate::reconcile::{PRIVACY_POLICY_KEY, extract_policy_analysis};
use crate::store::ResultStore;
use crate::trace::ScanTrace;
use crate::tracker::{FilterRules, extract_tracking};

/// Everything collected about a site before analysis.
#[derive(Default)]
pub struct ScanInput<'a> {
    pub trace: ScanTrace,
    /// Extracted privacy policy text.
    pub policy_text: Option<String>,
    /// Rendered page for link discovery.
    pub document: Option<&'a dyn Document>,
}

/// Runs every analysis stage for a scan.
pub struct Pipeline<'a> {
    domains: &'a DomainResolver,
    rules: &'a FilterRules,
    dns: &'a dyn DnsLookup,
    sources: Vec<&'a dyn AttributionSource>,
    options: ScannerOptions,
}

impl<'a> Pipeline<'a> {
    #[must_use]
    pub fn new(
        domains: &'a DomainResolver,
        rules: &'a FilterRules,
        dns: &'a dyn DnsLookup,
        options: ScannerOptions,
    ) -> Self {
        Self {
            domains,
            rules,
            dns,
            sources: Vec::new(),
            options,
        }
    }

    /// Appends an attribution source; sources run in registration order.
    #[must_use]
    pub fn with_source(mut self, source: &'a dyn AttributionSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Builds a pipeline over the shared reference data.
    ///
    /// Attribution sources whose dataset is unavailable are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError`] if the public suffix list or filter lists
    /// cannot be loaded.
    pub fn from_reference_data(
        data: &'a ReferenceData,
        dns: &'a dyn DnsLookup,
        options: ScannerOptions,
    ) -> Result<Self, DatasetError> {
        let mut pipeline = Self::new(data.domains()?, data.filter_rules()?, dns, options);
        match data.homepage_list() {
            Ok(source) => pipeline.sources.push(source),
            Err(error) => info!(
                error = %error,
                "homepage list unavailable; continuing with remaining sources"
            ),
        }
        match data.tracker_radar() {
            Ok(source) => pipeline.sources.push(source),
            Err(error) => info!(
                error = %error,
                "tracker-radar records unavailable; continuing without them"
            ),
        }
        Ok(pipeline)
    }

    /// Result fields written by the registered attribution sources.
    #[must_use]
    pub fn source_keys(&self) -> Vec<String> {
        self.sources.iter().map(|source| source.result_key()).collect()
    }

    /// Runs all stages, leaving the analysed trace in `input.trace`.
    #[instrument(skip_all, fields(site = %input.trace.site_url))]
    pub async fn run(&self, store: &mut dyn ResultStore, input: &mut ScanInput<'_>) {
        let trace = &mut input.trace;
        trace.normalize();
        let final_url = trace.final_url.clone();

        resolve_final_url_cname(store, &final_url, self.domains, self.dns).await;
        extract_third_parties(store, trace, self.domains, self.dns).await;
        extract_tracking(
            store,
            trace,
            self.rules,
            self.domains,
            self.options.uncloak_cnames,
        );
        for source in &self.sources {
            extract_attribution(store, *source, self.domains).await;
        }

        if let Some(document) = input.document {
            for target in [LinkTarget::privacy_policy(), LinkTarget::imprint()] {
                extract_link(
                    store,
                    document,
                    &target,
                    &final_url,
                    self.options.disable_javascript,
                )
                .await;
            }
        }

        if let Some(policy) = &input.policy_text {
            store.set(PRIVACY_POLICY_KEY, Value::String(policy.clone()));
            extract_policy_analysis(store, &self.source_keys());
        }
        info!("scan analysis complete");
    }
}
