//! Homepage-list attribution (disconnect.me `services.json`).
//!
//! The dataset nests `categories -> [ {company -> {homepage -> [domains]}} ]`.
//! Order matters: the first (category, company) in document order that
//! lists a domain wins.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use url::Url;

use super::{Attribution, AttributionSource};
use crate::domain::DomainResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Homepage {
    netloc: String,
    domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Company {
    name: String,
    homepages: Vec<Homepage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Category {
    name: String,
    companies: Vec<Company>,
}

/// Parsed `services.json`, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicesList {
    categories: Vec<Category>,
}

/// Reduces a homepage URL to its network location; non-`http(s)` keys yield `None`.
fn homepage_netloc(key: &str) -> Option<String> {
    if !key.starts_with("http") {
        return None;
    }
    let url = Url::parse(key).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
}

impl ServicesList {
    /// Builds the list from a `services.json` document.
    ///
    /// Homepage keys may be full URLs or bare netlocs; entries whose value is
    /// not a domain list are ignored.
    #[must_use]
    pub fn from_value(document: &Value) -> Self {
        let Some(categories) = document.get("categories").and_then(Value::as_object) else {
            return Self::default();
        };
        let categories = categories
            .iter()
            .map(|(name, entities)| Category {
                name: name.clone(),
                companies: entities
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_object)
                    .flat_map(|entity| entity.iter())
                    .map(|(company, homepages)| Company {
                        name: company.clone(),
                        homepages: homepages
                            .as_object()
                            .into_iter()
                            .flatten()
                            .filter_map(|(key, domains)| {
                                let netloc = homepage_netloc(key).unwrap_or_else(|| key.clone());
                                string_list(domains).map(|domains| Homepage { netloc, domains })
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Self { categories }
    }

    /// Parses `services.json` text.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if `raw` is not valid JSON.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let document: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(&document))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Rewrites homepage keys to netlocs and drops non-URL keys, in place.
///
/// Applied once when the dataset is refreshed.
pub fn normalize_services(document: &mut Value) {
    let Some(categories) = document.get_mut("categories").and_then(Value::as_object_mut) else {
        return;
    };
    for entities in categories.values_mut() {
        let Some(entities) = entities.as_array_mut() else {
            continue;
        };
        for entity in entities.iter_mut().filter_map(Value::as_object_mut) {
            for homepages in entity.values_mut() {
                let Some(map) = homepages.as_object() else {
                    continue;
                };
                let normalized: Map<String, Value> = map
                    .iter()
                    .filter_map(|(key, domains)| {
                        homepage_netloc(key).map(|netloc| (netloc, domains.clone()))
                    })
                    .collect();
                *homepages = Value::Object(normalized);
            }
        }
    }
}

/// Closest-ancestor lookup over a [`ServicesList`].
#[derive(Debug)]
pub struct HomepageListSource {
    list: ServicesList,
    /// domain -> (category index, company index) of its first occurrence.
    index: HashMap<String, (usize, usize)>,
}

impl HomepageListSource {
    #[must_use]
    pub fn new(list: ServicesList) -> Self {
        let mut index = HashMap::new();
        for (c, category) in list.categories.iter().enumerate() {
            for (e, company) in category.companies.iter().enumerate() {
                for homepage in &company.homepages {
                    for domain in std::iter::once(&homepage.netloc).chain(&homepage.domains) {
                        index.entry(domain.clone()).or_insert((c, e));
                    }
                }
            }
        }
        Self { list, index }
    }

    /// Returns `(category, company)` for the closest listed ancestor of `fqdn`.
    ///
    /// Walks from `fqdn` towards the root, stopping after `stop_domain`.
    #[must_use]
    pub fn closest_match(&self, fqdn: &str, stop_domain: &str) -> Option<(&str, &str)> {
        let mut current = fqdn;
        loop {
            if let Some(&(c, e)) = self.index.get(current) {
                let category = &self.list.categories[c];
                return Some((category.name.as_str(), category.companies[e].name.as_str()));
            }
            if current == stop_domain {
                return None;
            }
            current = current.split_once('.')?.1;
        }
    }
}

#[async_trait]
impl AttributionSource for HomepageListSource {
    fn name(&self) -> &'static str {
        "disconnectme"
    }

    #[instrument(skip_all, fields(source = "disconnectme", fqdns = fqdns.len()))]
    async fn attribute(&self, fqdns: &[String], domains: &DomainResolver) -> Attribution {
        let mut attribution = Attribution::default();
        for fqdn in fqdns {
            let parsed = domains.parse(fqdn);
            match self.closest_match(&parsed.fqdn, &parsed.registered_domain) {
                Some((category, company)) => {
                    debug!(fqdn = %parsed.fqdn, company, category, "matched homepage list");
                    attribution.record(company, None, [category], &parsed.fqdn);
                }
                None => attribution.unrecognized(&parsed.fqdn),
            }
        }
        attribution.finish()
    }
}
