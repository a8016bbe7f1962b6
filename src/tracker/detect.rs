//! Flags tracking requests and cookies of a classified trace.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use super::filter::FilterRules;
use crate::classify::{COOKIES_KEY, THIRD_PARTIES_KEY};
use crate::domain::DomainResolver;
use crate::store::{ResultStore, set_typed};
use crate::trace::ScanTrace;

/// Result field holding the [`TrackingSummary`].
pub const TRACKING_KEY: &str = "tracking";

/// Only this many characters of a request URL are matched.
const MATCH_PREFIX_CHARS: usize = 150;

/// Per-scan tracker counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSummary {
    /// Sorted tracker fqdns.
    pub trackers: Vec<String>,
    pub num_tracker_requests: u64,
    pub num_tracker_cookies: u64,
}

/// Matches third-party requests against filter rules.
pub struct TrackerDetector<'a> {
    rules: &'a FilterRules,
    domains: &'a DomainResolver,
    uncloak_cnames: bool,
}

fn match_prefix(url: &str) -> &str {
    url.char_indices()
        .nth(MATCH_PREFIX_CHARS)
        .map_or(url, |(end, _)| &url[..end])
}

impl<'a> TrackerDetector<'a> {
    #[must_use]
    pub fn new(rules: &'a FilterRules, domains: &'a DomainResolver) -> Self {
        Self {
            rules,
            domains,
            uncloak_cnames: true,
        }
    }

    /// Whether a request's CNAME target is matched when the request itself is not.
    #[must_use]
    pub fn with_uncloak_cnames(mut self, uncloak_cnames: bool) -> Self {
        self.uncloak_cnames = uncloak_cnames;
        self
    }

    /// Flags requests and cookies of `trace` in place.
    ///
    /// `cnames` is the cloaked-fqdn map from third-party classification;
    /// `None` means that stage did not record one.
    #[instrument(skip_all, fields(site_url = %trace.site_url))]
    pub fn detect(
        &self,
        trace: &mut ScanTrace,
        cnames: Option<&BTreeMap<String, String>>,
    ) -> TrackingSummary {
        let mut tracker_fqdns = BTreeSet::new();
        let mut tracker_domains = HashSet::new();
        let mut blacklist = HashSet::new();
        let mut summary = TrackingSummary::default();
        let mut evaluations = 0_u64;

        for request in &mut trace.requests {
            request.is_tracker = false;
            if !request.is_thirdparty || request.is_data_uri() {
                continue;
            }
            let netloc = request.parsed().netloc;
            let mut is_tracker = blacklist.contains(&netloc);
            if !is_tracker {
                is_tracker = self.rules.matches(
                    match_prefix(&request.url),
                    &request.document_url,
                    self.domains,
                );
                if self.uncloak_cnames && !is_tracker {
                    match cnames {
                        None => error!("missing third-party CNAMEs from classification"),
                        Some(cnames) => {
                            let fqdn = self.domains.parse(&request.url).fqdn;
                            if let Some(cname) = cnames.get(&fqdn) {
                                is_tracker = self.rules.matches(cname, cname, self.domains);
                                if is_tracker {
                                    debug!(fqdn = %fqdn, cname = %cname, "tracker behind CNAME");
                                }
                            }
                        }
                    }
                }
                evaluations += 1;
            }

            if is_tracker {
                request.is_tracker = true;
                let extracted = self.domains.parse(&request.url);
                if !extracted.fqdn.is_empty() {
                    tracker_fqdns.insert(extracted.fqdn);
                }
                tracker_domains.insert(extracted.registered_domain);
                summary.num_tracker_requests += 1;
                blacklist.insert(netloc);
            }
        }

        for cookie in &mut trace.cookies {
            let domain = cookie.domain.as_str();
            let is_tracker = if tracker_fqdns.contains(domain) || tracker_domains.contains(domain) {
                true
            } else if let Some(stripped) = domain.strip_prefix('.') {
                tracker_domains.contains(&self.domains.registered_domain(stripped))
            } else {
                false
            };
            cookie.is_tracker = is_tracker;
            if is_tracker {
                summary.num_tracker_cookies += 1;
            }
        }

        summary.trackers = tracker_fqdns.into_iter().collect();
        info!(
            trackers = summary.trackers.len(),
            tracker_requests = summary.num_tracker_requests,
            tracker_cookies = summary.num_tracker_cookies,
            evaluations,
            "tracker detection complete"
        );
        summary
    }
}

/// Stage entry: flags trackers and writes `tracking` and `cookies`.
pub fn extract_tracking(
    store: &mut dyn ResultStore,
    trace: &mut ScanTrace,
    rules: &FilterRules,
    domains: &DomainResolver,
    uncloak_cnames: bool,
) {
    let cnames: Option<BTreeMap<String, String>> = store
        .get(THIRD_PARTIES_KEY)
        .and_then(|summary| summary.get("cnames"))
        .cloned()
        .and_then(|cnames| serde_json::from_value(cnames).ok());

    let summary = TrackerDetector::new(rules, domains)
        .with_uncloak_cnames(uncloak_cnames)
        .detect(trace, cnames.as_ref());

    if let Err(err) = set_typed(store, TRACKING_KEY, &summary) {
        error!(error = %err, "could not store tracking summary");
        store.set(TRACKING_KEY, Value::Null);
        return;
    }
    match set_typed(store, COOKIES_KEY, &trace.cookies) {
        Ok(()) => store.mark_dirty(COOKIES_KEY),
        Err(err) => error!(error = %err, "could not store tracker cookies"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{ScanResult, get_typed};
    use crate::trace::{CookieRecord, RequestRecord};

    const LIST: &str = "// ===BEGIN ICANN DOMAINS===\ncom\nnet\norg\n";

    fn third_party(url: &str) -> RequestRecord {
        let mut request = RequestRecord::new(url, "https://www.site.com/");
        request.is_thirdparty = true;
        request
    }

    fn trace(requests: Vec<RequestRecord>, cookies: &[&str]) -> ScanTrace {
        ScanTrace {
            site_url: "https://site.com/".to_string(),
            final_url: "https://www.site.com/".to_string(),
            requests,
            cookies: cookies.iter().map(|d| CookieRecord::new(*d)).collect(),
        }
    }

    #[test]
    fn test_match_prefix_is_char_safe() {
        let url = format!("https://a.com/{}", "ü".repeat(200));
        let prefix = match_prefix(&url);
        assert_eq!(prefix.chars().count(), MATCH_PREFIX_CHARS);
        assert_eq!(match_prefix("https://short/"), "https://short/");
    }

    #[test]
    fn test_detects_trackers_and_skips_first_party() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["||tracker.net^\n||site.com/ads/"]);
        let mut first_party = RequestRecord::new("https://www.site.com/ads/a.js", "https://www.site.com/");
        first_party.is_thirdparty = false;
        let mut trace = trace(
            vec![
                third_party("https://px.tracker.net/p.gif"),
                third_party("https://px.tracker.net/second.gif"),
                third_party("https://cdn.other.org/lib.js"),
                first_party,
            ],
            &[],
        );

        let summary = TrackerDetector::new(&rules, &domains).detect(&mut trace, Some(&BTreeMap::new()));

        assert_eq!(summary.trackers, ["px.tracker.net"]);
        assert_eq!(summary.num_tracker_requests, 2);
        let flags: Vec<bool> = trace.requests.iter().map(|r| r.is_tracker).collect();
        assert_eq!(flags, [true, true, false, false]);
    }

    #[test]
    fn test_blacklisted_netloc_short_circuits_matching() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["/collect?"]);
        let mut trace = trace(
            vec![
                third_party("https://stats.metrics.org/collect?id=1"),
                third_party("https://stats.metrics.org/app.js"),
            ],
            &[],
        );

        let summary = TrackerDetector::new(&rules, &domains).detect(&mut trace, Some(&BTreeMap::new()));

        assert_eq!(summary.num_tracker_requests, 2);
        assert!(trace.requests[1].is_tracker);
    }

    #[test]
    fn test_cname_target_is_matched_when_uncloaking() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["||tracker.net^"]);
        let cnames = BTreeMap::from([("m.site.com".to_string(), "collect.tracker.net".to_string())]);

        let mut uncloaked = trace(vec![third_party("https://m.site.com/c")], &[]);
        let summary = TrackerDetector::new(&rules, &domains).detect(&mut uncloaked, Some(&cnames));
        assert_eq!(summary.trackers, ["m.site.com"]);

        let mut cloaked = trace(vec![third_party("https://m.site.com/c")], &[]);
        let summary = TrackerDetector::new(&rules, &domains)
            .with_uncloak_cnames(false)
            .detect(&mut cloaked, Some(&cnames));
        assert!(summary.trackers.is_empty());
    }

    #[test]
    fn test_missing_cnames_is_not_fatal() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["||tracker.net^"]);
        let mut trace = trace(vec![third_party("https://cdn.other.org/x")], &[]);
        let summary = TrackerDetector::new(&rules, &domains).detect(&mut trace, None);
        assert_eq!(summary, TrackingSummary::default());
    }

    #[test]
    fn test_cookie_tracker_matching() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["||px.tracker.net^"]);
        let mut trace = trace(
            vec![third_party("https://px.tracker.net/p.gif")],
            &["px.tracker.net", "tracker.net", ".tracker.net", ".www.tracker.net", "other.tracker.net", "site.com"],
        );

        let summary = TrackerDetector::new(&rules, &domains).detect(&mut trace, Some(&BTreeMap::new()));

        let flags: Vec<bool> = trace.cookies.iter().map(|c| c.is_tracker).collect();
        assert_eq!(flags, [true, true, true, true, false, false]);
        assert_eq!(summary.num_tracker_cookies, 4);
    }

    #[test]
    fn test_stage_reads_cnames_and_writes_tracking() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let rules = FilterRules::parse(["||tracker.net^"]);
        let mut store = ScanResult::for_site("https://site.com/");
        store.set(
            THIRD_PARTIES_KEY,
            serde_json::json!({"fqdns": [], "cnames": {"m.site.com": "tracker.net"},
                               "num_http_requests": 0, "num_https_requests": 1}),
        );
        let mut trace = trace(vec![third_party("https://m.site.com/c")], &[".site.com"]);

        extract_tracking(&mut store, &mut trace, &rules, &domains, true);

        let tracking: TrackingSummary = get_typed(&store, TRACKING_KEY).unwrap().unwrap();
        assert_eq!(tracking.trackers, ["m.site.com"]);
        assert_eq!(tracking.num_tracker_requests, 1);
        assert!(store.dirty_keys().contains(COOKIES_KEY));
    }
}
