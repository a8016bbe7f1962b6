//! Cross-checks attributed owners against the privacy policy text.
//!
//! Every owner from every available attribution source is either
//! *mentioned* in the policy or *missing* from it. Third-party fqdns no
//! source attributed end up in `unattributed_third_party_fqdns`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::attribution::{Attribution, OwnerAttribution};
use crate::classify::THIRD_PARTIES_KEY;
use crate::store::{ResultStore, get_typed, set_typed};

/// Result field holding the [`MentionIndex`].
pub const POLICY_ANALYSIS_KEY: &str = "privacy_policy_analysis";
/// Result field holding the extracted policy text.
pub const PRIVACY_POLICY_KEY: &str = "privacy_policy";

/// Names up to this length are only matched case-sensitively.
const SHORT_NAME_CHARS: usize = 3;

/// Owners partitioned by whether the policy names them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionIndex {
    pub mentioned: BTreeMap<String, BTreeSet<String>>,
    pub missing: BTreeMap<String, BTreeSet<String>>,
    pub unattributed_third_party_fqdns: Vec<String>,
}

/// Full case folding: lowercase plus the expanding folds (`ß` to `ss`, ligatures).
fn case_fold(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            'ß' | 'ẞ' => folded.push_str("ss"),
            'ſ' => folded.push('s'),
            'ς' => folded.push('σ'),
            'ŉ' => folded.push_str("ʼn"),
            'ﬀ' => folded.push_str("ff"),
            'ﬁ' => folded.push_str("fi"),
            'ﬂ' => folded.push_str("fl"),
            'ﬃ' => folded.push_str("ffi"),
            'ﬄ' => folded.push_str("ffl"),
            'ﬅ' | 'ﬆ' => folded.push_str("st"),
            _ => folded.extend(ch.to_lowercase()),
        }
    }
    folded
}

/// Policy text with its case-folded form.
#[derive(Debug, Clone)]
pub struct PolicyText<'a> {
    text: &'a str,
    folded: String,
}

impl<'a> PolicyText<'a> {
    #[must_use]
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            folded: case_fold(text),
        }
    }

    /// Whether `name` occurs in the policy.
    ///
    /// Names longer than three characters match case-insensitively, shorter
    /// ones (acronyms) only verbatim.
    #[must_use]
    pub fn mentions(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if name.chars().count() > SHORT_NAME_CHARS {
            self.folded.contains(&case_fold(name))
        } else {
            self.text.contains(name)
        }
    }

    fn mentions_owner(&self, owner_key: &str, owner: &OwnerAttribution) -> bool {
        self.mentions(owner_key)
            || owner
                .display_name
                .as_deref()
                .is_some_and(|display_name| self.mentions(display_name))
    }
}

/// Moves every missing org sharing an fqdn with a mentioned org into that org.
///
/// Repeats until no shared fqdn is left, since a merge can expose new overlaps.
fn resolve_conflicts(
    mentioned: &mut BTreeMap<String, BTreeSet<String>>,
    missing: &mut BTreeMap<String, BTreeSet<String>>,
) {
    loop {
        let mut changed = false;
        for (org, fqdns) in missing.clone() {
            for fqdn in &fqdns {
                let Some(target) = mentioned
                    .iter()
                    .find(|(_, known)| known.contains(fqdn))
                    .map(|(target, _)| target.clone())
                else {
                    continue;
                };
                if missing.remove(&org).is_some() {
                    debug!(org = %org, into = %target, fqdn = %fqdn, "moving org to mentioned");
                    changed = true;
                }
                if let Some(known) = mentioned.get_mut(&target) {
                    known.extend(fqdns.iter().cloned());
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Builds the mention index for `policy` over `attributions`, in order.
#[must_use]
pub fn reconcile(
    policy: &str,
    attributions: &[&Attribution],
    third_party_fqdns: &[String],
) -> MentionIndex {
    let policy = PolicyText::new(policy);
    let mut index = MentionIndex::default();

    for attribution in attributions {
        for (owner_key, owner) in &attribution.owners {
            let bucket = if policy.mentions_owner(owner_key, owner) {
                &mut index.mentioned
            } else {
                &mut index.missing
            };
            bucket
                .entry(owner_key.clone())
                .or_default()
                .extend(owner.fqdns.iter().cloned());
        }
    }

    resolve_conflicts(&mut index.mentioned, &mut index.missing);

    index.unattributed_third_party_fqdns = third_party_fqdns
        .iter()
        .filter(|fqdn| {
            !index
                .mentioned
                .values()
                .chain(index.missing.values())
                .any(|fqdns| fqdns.contains(fqdn.as_str()))
        })
        .cloned()
        .collect();
    index
}

/// Stage entry: writes `privacy_policy_analysis` from the policy text and the
/// `third_parties_<source>` fields named in `source_keys`.
///
/// The field is null when the policy text or the third-party summary is missing.
#[instrument(skip_all)]
pub fn extract_policy_analysis(store: &mut dyn ResultStore, source_keys: &[String]) {
    store.set(POLICY_ANALYSIS_KEY, Value::Null);

    let Some(policy) = store
        .get(PRIVACY_POLICY_KEY)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
    else {
        error!("missing `privacy_policy` text");
        return;
    };
    let Some(third_parties) = store.get(THIRD_PARTIES_KEY) else {
        error!("missing `third_parties` from third-party classification");
        return;
    };
    let fqdns: Vec<String> = third_parties
        .get("fqdns")
        .cloned()
        .and_then(|fqdns| serde_json::from_value(fqdns).ok())
        .unwrap_or_default();

    let mut attributions = Vec::new();
    for key in source_keys {
        if !store.has_truthy(key) {
            info!(source = %key, "attribution source missing");
            continue;
        }
        match get_typed::<Attribution>(store, key) {
            Ok(Some(attribution)) => attributions.push(attribution),
            Ok(None) => info!(source = %key, "attribution source missing"),
            Err(err) => warn!(source = %key, error = %err, "ignoring unreadable attribution"),
        }
    }
    if attributions.is_empty() {
        info!("no attributed organizations; nothing to reconcile");
        return;
    }

    let index = reconcile(&policy, &attributions.iter().collect::<Vec<_>>(), &fqdns);
    info!(
        mentioned = index.mentioned.len(),
        missing = index.missing.len(),
        unattributed = index.unattributed_third_party_fqdns.len(),
        "policy reconciliation complete"
    );
    match set_typed(store, POLICY_ANALYSIS_KEY, &index) {
        Ok(()) => store.mark_dirty(POLICY_ANALYSIS_KEY),
        Err(err) => error!(error = %err, "could not store policy analysis"),
    }
}
