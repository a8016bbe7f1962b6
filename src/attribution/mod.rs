//! Third-party attribution to owning companies.
//!
//! Each [`AttributionSource`] maps third-party fqdns to owners using its own
//! dataset and closest-ancestor lookup, producing an [`Attribution`] that is
//! written to `third_parties_<source>`.
//!
//! # Architecture
//!
//! - [`AttributionSource`] - async trait implemented by each dataset
//! - [`HomepageListSource`] - curated category/company/homepage list (disconnect.me)
//! - [`TrackerRadarSource`] - one ownership record per domain (DuckDuckGo Tracker Radar)
//! - [`extract_attribution`] - stage entry reading `third_parties.fqdns`

mod homepage;
mod tracker_radar;

pub use homepage::{HomepageListSource, ServicesList, normalize_services};
pub use tracker_radar::{DomainRecord, RecordOwner, TrackerRadarSource};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::classify::THIRD_PARTIES_KEY;
use crate::domain::DomainResolver;
use crate::store::{ResultStore, set_typed};

/// Prefix of the result field each source writes.
pub const RESULT_KEY_PREFIX: &str = "third_parties_";

/// Everything attributed to one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerAttribution {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub fqdns: BTreeSet<String>,
}

/// Output of one source for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Owner key -> attributed fqdns, in key order.
    pub owners: BTreeMap<String, OwnerAttribution>,
    /// Sorted fqdns no record matched.
    pub unrecognized_fqdns: Vec<String>,
}

impl Attribution {
    /// Adds `fqdn` and `categories` to the owner keyed `name`.
    pub fn record<I>(&mut self, name: &str, display_name: Option<&str>, categories: I, fqdn: &str)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let owner = self
            .owners
            .entry(name.to_string())
            .or_insert_with(|| OwnerAttribution {
                name: name.to_string(),
                ..OwnerAttribution::default()
            });
        if let Some(display_name) = display_name {
            owner.display_name = Some(display_name.to_string());
        }
        owner.categories.extend(categories.into_iter().map(Into::into));
        owner.fqdns.insert(fqdn.to_string());
    }

    pub fn unrecognized(&mut self, fqdn: &str) {
        if !self.unrecognized_fqdns.iter().any(|known| known == fqdn) {
            self.unrecognized_fqdns.push(fqdn.to_string());
        }
    }

    /// Sorts `unrecognized_fqdns`.
    #[must_use]
    pub fn finish(mut self) -> Self {
        self.unrecognized_fqdns.sort();
        self
    }
}

/// A dataset mapping fqdns to owners.
#[async_trait]
pub trait AttributionSource: Send + Sync {
    /// Short source name; the result field is `third_parties_<name>`.
    fn name(&self) -> &'static str;

    /// Result field this source writes.
    fn result_key(&self) -> String {
        format!("{RESULT_KEY_PREFIX}{}", self.name())
    }

    /// Attributes every fqdn, collecting misses in `unrecognized_fqdns`.
    async fn attribute(&self, fqdns: &[String], domains: &DomainResolver) -> Attribution;
}

/// Stage entry: attributes `third_parties.fqdns` and writes the source's field.
///
/// Leaves the field untouched when third-party classification has not run.
#[instrument(skip_all, fields(source = source.name()))]
pub async fn extract_attribution(
    store: &mut dyn ResultStore,
    source: &dyn AttributionSource,
    domains: &DomainResolver,
) {
    let Some(fqdns) = store
        .get(THIRD_PARTIES_KEY)
        .and_then(|summary| summary.get("fqdns"))
        .and_then(|fqdns| serde_json::from_value::<Vec<String>>(fqdns.clone()).ok())
    else {
        error!("missing `third_parties` or `fqdns`");
        return;
    };

    let attribution = if fqdns.is_empty() {
        Attribution::default()
    } else {
        source.attribute(&fqdns, domains).await
    };
    info!(
        owners = attribution.owners.len(),
        unrecognized = attribution.unrecognized_fqdns.len(),
        "attribution complete"
    );

    let key = source.result_key();
    match set_typed(store, &key, &attribution) {
        Ok(()) => store.mark_dirty(&key),
        Err(err) => error!(error = %err, key = %key, "could not store attribution"),
    }
}
