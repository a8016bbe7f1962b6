//! First-party / third-party partitioning of a captured trace.
//!
//! A request is third-party when its registered domain differs from both the
//! site URL's and the final URL's registered domain. First-party-looking
//! requests are additionally checked for CNAME cloaking: when the hostname's
//! canonical name belongs to another registered domain (and is not simply the
//! final URL's own CNAME) the request is treated as third-party.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::dns::{DnsLookup, RecordType, get_cname};
use crate::domain::DomainResolver;
use crate::store::{ResultStore, set_typed};
use crate::trace::ScanTrace;

/// Result field holding the [`ThirdPartySummary`].
pub const THIRD_PARTIES_KEY: &str = "third_parties";
/// Result field holding the final URL.
pub const FINAL_URL_KEY: &str = "final_url";
/// Result field holding the canonical name of the final URL's host.
pub const FINAL_URL_CNAME_KEY: &str = "final_url_cname";
/// Result field holding the cookie list with classification flags.
pub const COOKIES_KEY: &str = "cookies";

/// Per-scan summary of third-party activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartySummary {
    /// Sorted third-party fqdns, including uncloaked CNAME targets.
    pub fqdns: Vec<String>,
    /// Cloaked first-party fqdn -> third-party canonical fqdn.
    pub cnames: BTreeMap<String, String>,
    pub num_http_requests: u64,
    pub num_https_requests: u64,
}

/// Partitions requests and cookies of one trace.
pub struct ThirdPartyClassifier<'a> {
    domains: &'a DomainResolver,
    dns: &'a dyn DnsLookup,
}

impl<'a> ThirdPartyClassifier<'a> {
    #[must_use]
    pub fn new(domains: &'a DomainResolver, dns: &'a dyn DnsLookup) -> Self {
        Self { domains, dns }
    }

    /// Registered domains of the site URL and the final URL.
    #[must_use]
    pub fn first_party_domains(&self, site_url: &str, final_url: &str) -> HashSet<String> {
        [site_url, final_url]
            .iter()
            .map(|url| self.domains.registered_domain(url))
            .collect()
    }

    /// Classifies every request and cookie of `trace` in place.
    ///
    /// `final_url_cname` is the canonical name already recorded for the final
    /// URL; a first-party request whose CNAME equals it stays first-party.
    #[instrument(skip_all, fields(site_url = %trace.site_url, requests = trace.requests.len()))]
    pub async fn classify(
        &self,
        trace: &mut ScanTrace,
        final_url_cname: Option<&str>,
    ) -> ThirdPartySummary {
        let first_party = self.first_party_domains(&trace.site_url, &trace.final_url);
        let mut fqdns = BTreeSet::new();
        let mut summary = ThirdPartySummary::default();

        for request in &mut trace.requests {
            request.is_thirdparty = false;
            if request.is_data_uri() {
                continue;
            }

            let extracted = self.domains.parse(&request.url);
            let mut uncloaked = None;
            if first_party.contains(&extracted.registered_domain) {
                let Some(cname) = get_cname(self.dns, &extracted.fqdn, RecordType::A).await else {
                    continue;
                };
                let parsed_cname = self.domains.parse(&cname);
                if first_party.contains(&parsed_cname.registered_domain)
                    || final_url_cname == Some(cname.as_str())
                {
                    continue;
                }
                debug!(fqdn = %extracted.fqdn, cname = %parsed_cname.fqdn, "CNAME-cloaked third party");
                summary
                    .cnames
                    .insert(extracted.fqdn.clone(), parsed_cname.fqdn.clone());
                uncloaked = Some(parsed_cname.fqdn);
            }

            request.is_thirdparty = true;
            fqdns.insert(extracted.fqdn);
            if let Some(cname_fqdn) = uncloaked {
                fqdns.insert(cname_fqdn);
            }
            match request.parsed().scheme.as_str() {
                "http" => summary.num_http_requests += 1,
                "https" => summary.num_https_requests += 1,
                _ => {}
            }
        }
        summary.fqdns = fqdns.into_iter().collect();

        for cookie in &mut trace.cookies {
            let domain = cookie.domain.strip_prefix('.').unwrap_or(&cookie.domain);
            let registered = self.domains.registered_domain(domain);
            cookie.is_thirdparty = !first_party.contains(&registered);
        }

        info!(
            third_party_fqdns = summary.fqdns.len(),
            cloaked = summary.cnames.len(),
            "third-party classification complete"
        );
        summary
    }
}

/// Records `final_url` and the canonical name of its host.
#[instrument(skip_all, fields(final_url = %final_url))]
pub async fn resolve_final_url_cname(
    store: &mut dyn ResultStore,
    final_url: &str,
    domains: &DomainResolver,
    dns: &dyn DnsLookup,
) {
    let fqdn = domains.parse(final_url).fqdn;
    let cname = get_cname(dns, &fqdn, RecordType::A).await;
    store.set(FINAL_URL_KEY, Value::String(final_url.to_string()));
    store.set(
        FINAL_URL_CNAME_KEY,
        cname.map_or(Value::Null, Value::String),
    );
}

/// Stage entry: classifies `trace` and writes `third_parties` and `cookies`.
pub async fn extract_third_parties(
    store: &mut dyn ResultStore,
    trace: &mut ScanTrace,
    domains: &DomainResolver,
    dns: &dyn DnsLookup,
) {
    let final_url_cname = store
        .get(FINAL_URL_CNAME_KEY)
        .and_then(Value::as_str)
        .map(str::to_string);
    let summary = ThirdPartyClassifier::new(domains, dns)
        .classify(trace, final_url_cname.as_deref())
        .await;

    if let Err(err) = set_typed(store, THIRD_PARTIES_KEY, &summary) {
        error!(error = %err, "could not store third-party summary");
        return;
    }
    match set_typed(store, COOKIES_KEY, &trace.cookies) {
        Ok(()) => store.mark_dirty(COOKIES_KEY),
        Err(err) => error!(error = %err, "could not store classified cookies"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dns::StaticDnsLookup;
    use crate::store::{ScanResult, get_typed};
    use crate::trace::{CookieRecord, RequestRecord};

    const LIST: &str = "// ===BEGIN ICANN DOMAINS===\ncom\nnet\norg\nco.uk\n";

    fn trace(requests: &[&str], cookies: &[&str]) -> ScanTrace {
        ScanTrace {
            site_url: "https://example.com/".to_string(),
            final_url: "https://www.example.com/".to_string(),
            requests: requests
                .iter()
                .map(|url| RequestRecord::new(*url, "https://www.example.com/"))
                .collect(),
            cookies: cookies.iter().map(|d| CookieRecord::new(*d)).collect(),
        }
    }

    #[tokio::test]
    async fn test_plain_third_party_partition() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new();
        let mut trace = trace(
            &[
                "https://www.example.com/app.js",
                "https://cdn.tracker.net/t.js",
                "http://ads.other.org/pixel.gif",
                "wss://live.other.org/socket",
                "data:image/gif;base64,R0lGOD",
            ],
            &[],
        );
        let summary = ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, None)
            .await;

        assert_eq!(
            summary.fqdns,
            ["ads.other.org", "cdn.tracker.net", "live.other.org"]
        );
        assert_eq!(summary.num_https_requests, 1);
        assert_eq!(summary.num_http_requests, 1);
        assert!(summary.cnames.is_empty());
        let flags: Vec<bool> = trace.requests.iter().map(|r| r.is_thirdparty).collect();
        assert_eq!(flags, [false, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_cname_cloaked_request_is_third_party() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_cname("cdn.example.com", "tracker.net");
        let mut trace = trace(&["https://cdn.example.com/collect"], &[]);

        let summary = ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, None)
            .await;

        assert!(trace.requests[0].is_thirdparty);
        assert_eq!(summary.cnames.get("cdn.example.com").unwrap(), "tracker.net");
        assert_eq!(summary.fqdns, ["cdn.example.com", "tracker.net"]);
        assert_eq!(summary.num_https_requests, 1);
    }

    #[tokio::test]
    async fn test_cname_to_same_registered_domain_stays_first_party() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_cname("www.example.com", "edge.example.com");
        let mut trace = trace(&["https://www.example.com/index.css"], &[]);

        let summary = ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, None)
            .await;

        assert!(!trace.requests[0].is_thirdparty);
        assert!(summary.fqdns.is_empty());
        assert!(summary.cnames.is_empty());
    }

    #[tokio::test]
    async fn test_cname_equal_to_final_url_cname_stays_first_party() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_cname("static.example.com", "example.cdnhost.net");
        let mut trace = trace(&["https://static.example.com/a.png"], &[]);

        let summary = ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, Some("example.cdnhost.net"))
            .await;

        assert!(!trace.requests[0].is_thirdparty);
        assert!(summary.cnames.is_empty());
    }

    #[tokio::test]
    async fn test_dns_failure_is_fail_open() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_failure("api.example.com", "SERVFAIL");
        let mut trace = trace(&["https://api.example.com/v1"], &[]);

        let summary = ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, None)
            .await;

        assert!(!trace.requests[0].is_thirdparty);
        assert!(summary.fqdns.is_empty());
    }

    #[tokio::test]
    async fn test_cookie_classification_strips_leading_dot() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new();
        let mut trace = trace(&[], &[".example.com", "www.example.com", ".tracker.net"]);

        ThirdPartyClassifier::new(&domains, &dns)
            .classify(&mut trace, None)
            .await;

        let flags: Vec<bool> = trace.cookies.iter().map(|c| c.is_thirdparty).collect();
        assert_eq!(flags, [false, false, true]);
    }

    #[tokio::test]
    async fn test_classification_is_idempotent() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_cname("m.example.com", "collector.metrics.net");
        let mut trace = trace(
            &[
                "https://m.example.com/c",
                "https://b.cdn.org/x.js",
                "https://a.cdn.org/y.js",
            ],
            &[".cdn.org"],
        );
        let classifier = ThirdPartyClassifier::new(&domains, &dns);
        let first = classifier.classify(&mut trace, None).await;
        let snapshot = trace.clone();
        let second = classifier.classify(&mut trace, None).await;
        assert_eq!(first, second);
        assert_eq!(snapshot, trace);
    }

    #[tokio::test]
    async fn test_stage_writes_summary_and_dirty_cookies() {
        let domains = DomainResolver::from_list_str(LIST).unwrap();
        let dns = StaticDnsLookup::new().with_cname("www.example.com", "shop.hosting.net");
        let mut store = ScanResult::for_site("https://example.com/");
        let mut trace = trace(&["https://www.example.com/", "https://t.tracker.net/"], &["t.tracker.net"]);

        resolve_final_url_cname(&mut store, &trace.final_url.clone(), &domains, &dns).await;
        assert_eq!(
            store.get(FINAL_URL_CNAME_KEY).and_then(Value::as_str),
            Some("shop.hosting.net")
        );

        extract_third_parties(&mut store, &mut trace, &domains, &dns).await;
        let summary: ThirdPartySummary = get_typed(&store, THIRD_PARTIES_KEY).unwrap().unwrap();
        assert_eq!(summary.fqdns, ["t.tracker.net"]);
        assert!(store.dirty_keys().contains(COOKIES_KEY));
        assert_eq!(store.get(COOKIES_KEY).unwrap()[0]["is_thirdparty"], Value::Bool(true));
    }
}
