//! Keyword-ranked link discovery (privacy policy, imprint, ...).
//!
//! The search runs in two tiers against a [`Document`]:
//!
//! 1. text search for each keyword, walking up from every hit to the
//!    enclosing visible `<a href>`;
//! 2. when tier 1 found nothing at the best priority, a scan of the raw
//!    markup of every link, including invisible ones.
//!
//! The candidate with the lowest priority value wins; among equals the first
//! one discovered wins. Script execution is suspended for the whole search.

mod snapshot;

pub use snapshot::HtmlSnapshotDocument;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::store::ResultStore;

/// DOM node type of element nodes.
pub const ELEMENT_NODE: u32 = 1;
/// DOM node type of text nodes.
pub const TEXT_NODE: u32 = 3;

/// Handle to a node of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Errors from document access.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The node no longer exists (detached while searching).
    #[error("node {0:?} not found")]
    NodeNotFound(NodeId),

    /// The selector could not be parsed.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// The document backend rejected a call.
    #[error("document call {method} failed: {reason}")]
    Protocol { method: &'static str, reason: String },
}

/// Node metadata needed to walk towards a link element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescription {
    pub node_type: u32,
    /// Upper-case tag name for elements, `#text` for text nodes.
    pub node_name: String,
    pub parent_id: Option<NodeId>,
}

impl NodeDescription {
    fn is_link(&self) -> bool {
        self.node_type == ELEMENT_NODE && self.node_name.eq_ignore_ascii_case("a")
    }
}

/// Access to a rendered document.
#[async_trait]
pub trait Document: Send + Sync {
    /// All elements matching a CSS selector, in document order.
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>, DocumentError>;

    /// Nodes whose text contains `query`.
    async fn perform_search(&self, query: &str) -> Result<Vec<NodeId>, DocumentError>;

    async fn describe_node(&self, node: NodeId) -> Result<NodeDescription, DocumentError>;

    async fn get_attribute(&self, node: NodeId, name: &str)
    -> Result<Option<String>, DocumentError>;

    async fn outer_html(&self, node: NodeId) -> Result<String, DocumentError>;

    /// Whether the node is rendered with a layout box.
    async fn has_box_model(&self, node: NodeId) -> Result<bool, DocumentError>;

    async fn set_script_execution_disabled(&self, disabled: bool) -> Result<(), DocumentError>;

    /// Re-enables scripts without waiting for the page to acknowledge.
    ///
    /// Used when a [`ScriptsDisabled`] guard is dropped before its release.
    fn enable_scripts_detached(&self);
}

/// A link found for a keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub keyword: String,
    /// Rank; lower wins.
    pub priority: i32,
    /// Raw `href` value.
    pub url: String,
}

/// What to look for and where to store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    keywords: Vec<(String, i32)>,
    result_key: String,
}

impl LinkTarget {
    /// Keywords with explicit priorities, searched in the given order.
    pub fn new<K: Into<String>>(
        keywords: impl IntoIterator<Item = (K, i32)>,
        result_key: impl Into<String>,
    ) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|(keyword, priority)| (keyword.into(), priority))
                .collect(),
            result_key: result_key.into(),
        }
    }

    /// Keywords that are all equally good (priority 0).
    pub fn from_list<K: Into<String>>(
        keywords: impl IntoIterator<Item = K>,
        result_key: impl Into<String>,
    ) -> Self {
        Self::new(keywords.into_iter().map(|k| (k, 0)), result_key)
    }

    #[must_use]
    pub fn privacy_policy() -> Self {
        Self::from_list(
            ["Privacy Policy", "Datenschutz", "Privacy", "Ihre Daten"],
            "privacy_policy_url",
        )
    }

    #[must_use]
    pub fn imprint() -> Self {
        Self::from_list(
            ["imprint", "impressum", "contact", "kontakt", "about us", "über uns"],
            "imprint_url",
        )
    }

    #[must_use]
    pub fn keywords(&self) -> &[(String, i32)] {
        &self.keywords
    }

    #[must_use]
    pub fn result_key(&self) -> &str {
        &self.result_key
    }

    /// Best priority any keyword can reach.
    #[must_use]
    pub fn top_priority(&self) -> i32 {
        self.keywords.iter().map(|(_, p)| *p).min().unwrap_or(0)
    }
}

/// Suspends script execution until [`ScriptsDisabled::release`].
///
/// Both ends are no-ops when scripts were already disabled for the page. A
/// guard dropped without release (panic, cancelled future) re-enables scripts
/// through [`Document::enable_scripts_detached`].
#[must_use = "release the guard to restore script execution"]
pub struct ScriptsDisabled<'a> {
    document: &'a dyn Document,
    toggled: bool,
}

impl<'a> ScriptsDisabled<'a> {
    pub async fn acquire(document: &'a dyn Document, already_disabled: bool) -> Self {
        if already_disabled {
            return Self {
                document,
                toggled: false,
            };
        }
        let toggled = match document.set_script_execution_disabled(true).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "could not disable script execution");
                false
            }
        };
        Self { document, toggled }
    }

    pub async fn release(mut self) {
        if !self.toggled {
            return;
        }
        if let Err(err) = self.document.set_script_execution_disabled(false).await {
            warn!(error = %err, "could not re-enable script execution");
        }
        self.toggled = false;
    }
}

impl Drop for ScriptsDisabled<'_> {
    fn drop(&mut self) {
        if self.toggled {
            warn!("script guard dropped before release; re-enabling scripts");
            self.document.enable_scripts_detached();
        }
    }
}

/// Keyword link search over one document.
pub struct LinkDiscovery<'a> {
    document: &'a dyn Document,
    scripts_already_disabled: bool,
}

/// First candidate with the lowest priority.
fn best_of(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .reduce(|best, next| if next.priority < best.priority { next } else { best })
}

impl<'a> LinkDiscovery<'a> {
    #[must_use]
    pub fn new(document: &'a dyn Document) -> Self {
        Self {
            document,
            scripts_already_disabled: false,
        }
    }

    /// Marks the page as already running without scripts.
    #[must_use]
    pub fn with_scripts_already_disabled(mut self, disabled: bool) -> Self {
        self.scripts_already_disabled = disabled;
        self
    }

    /// Returns the best candidate for `target`, with scripts suspended.
    #[instrument(skip_all, fields(result_key = %target.result_key()))]
    pub async fn best_candidate(&self, target: &LinkTarget) -> Option<Candidate> {
        let guard = ScriptsDisabled::acquire(self.document, self.scripts_already_disabled).await;
        let candidates = self.candidates(target).await;
        guard.release().await;
        best_of(&candidates).cloned()
    }

    /// Every candidate both tiers collected, in discovery order.
    pub async fn candidates(&self, target: &LinkTarget) -> Vec<Candidate> {
        let top_priority = target.top_priority();
        let links = self
            .document
            .query_selector_all("a")
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "could not list link elements");
                Vec::new()
            });

        let mut candidates = Vec::new();
        for (keyword, priority) in target.keywords() {
            self.search_keyword(keyword, *priority, top_priority, &mut candidates)
                .await;
        }

        let tier_one_best = best_of(&candidates).map(|c| c.priority);
        if tier_one_best != Some(top_priority) {
            debug!(links = links.len(), "falling back to link markup scan");
            for link in links {
                let html = match self.document.outer_html(link).await {
                    Ok(html) => html,
                    Err(err) => {
                        debug!(error = %err, "link disappeared during markup scan");
                        continue;
                    }
                };
                for (keyword, priority) in target.keywords() {
                    if html.contains(keyword.as_str())
                        && let Some(href) = self.href(link).await
                    {
                        candidates.push(Candidate {
                            keyword: keyword.clone(),
                            priority: *priority,
                            url: href,
                        });
                    }
                }
            }
        }
        candidates
    }

    async fn search_keyword(
        &self,
        keyword: &str,
        priority: i32,
        top_priority: i32,
        candidates: &mut Vec<Candidate>,
    ) {
        let hits = match self.document.perform_search(keyword).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(keyword, error = %err, "text search failed");
                return;
            }
        };
        'hits: for hit in hits {
            let mut current = Some(hit);
            while let Some(node) = current {
                let description = match self.document.describe_node(node).await {
                    Ok(description) => description,
                    Err(err) => {
                        debug!(error = %err, "node disappeared during search");
                        break;
                    }
                };
                if description.is_link() {
                    if !self.document.has_box_model(node).await.unwrap_or(false) {
                        break;
                    }
                    if let Some(href) = self.href(node).await {
                        candidates.push(Candidate {
                            keyword: keyword.to_string(),
                            priority,
                            url: href,
                        });
                        if priority == top_priority {
                            break 'hits;
                        }
                    }
                }
                current = description.parent_id;
            }
        }
    }

    async fn href(&self, node: NodeId) -> Option<String> {
        match self.document.get_attribute(node, "href").await {
            Ok(href) => href.filter(|href| !href.is_empty()),
            Err(err) => {
                debug!(error = %err, "could not read href");
                None
            }
        }
    }
}

/// Resolves a link `href` against the final page URL.
///
/// Scheme-relative links take the page scheme, root-relative links the page
/// scheme and host; anything else that is not already `http(s)://` is
/// resolved against the page URL's directory.
#[must_use]
pub fn normalize_href(href: &str, final_url: &str) -> String {
    if href.starts_with("//") {
        return match Url::parse(final_url) {
            Ok(url) => format!("{}:{href}", url.scheme()),
            Err(_) => href.to_string(),
        };
    }
    if href.starts_with('/') {
        // host only: the page port is not carried over
        return match Url::parse(final_url) {
            Ok(url) => format!("{}://{}{href}", url.scheme(), url.host_str().unwrap_or_default()),
            Err(_) => href.to_string(),
        };
    }
    if href.starts_with("https://") || href.starts_with("http://") {
        return href.to_string();
    }
    if let Ok(joined) = Url::parse(final_url).and_then(|base| base.join(href)) {
        return joined.into();
    }
    let base = final_url.rsplit_once('/').map_or(final_url, |(base, _)| base);
    format!("{base}/{href}")
}

/// Stage entry: writes `<result_key>` and `<result_key>_keyword` (null when nothing is found).
pub async fn extract_link(
    store: &mut dyn ResultStore,
    document: &dyn Document,
    target: &LinkTarget,
    final_url: &str,
    scripts_already_disabled: bool,
) -> Option<Candidate> {
    let best = LinkDiscovery::new(document)
        .with_scripts_already_disabled(scripts_already_disabled)
        .best_candidate(target)
        .await;
    let key = target.result_key();
    let keyword_key = format!("{key}_keyword");
    match &best {
        Some(candidate) => {
            let url = normalize_href(&candidate.url, final_url);
            info!(key, url = %url, keyword = %candidate.keyword, "keyword link found");
            store.set(key, Value::String(url));
            store.set(&keyword_key, Value::String(candidate.keyword.clone()));
        }
        None => {
            info!(key, "no keyword link found");
            store.set(key, Value::Null);
            store.set(&keyword_key, Value::Null);
        }
    }
    best
}
