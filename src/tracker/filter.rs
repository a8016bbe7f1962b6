//! Adblock-style network filter rules (EasyList / EasyPrivacy syntax).
//!
//! Supports the subset needed to classify already-captured requests:
//! `||host^` anchors, `|` start/end anchors, `*` wildcards, `^` separators,
//! `/regex/` rules, `@@` exceptions and the `third-party`, `domain=` and
//! `match-case` options. Cosmetic rules and rules whose options need a
//! resource type or a live page are skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::domain::DomainResolver;

/// Filter lists fetched by the dataset refresh and loaded by the detector.
pub const DEFAULT_FILTER_LISTS: [&str; 3] =
    ["easylist.txt", "easyprivacy.txt", "fanboy-annoyance.txt"];

/// Options that cannot be evaluated against a captured request.
const UNSUPPORTED_OPTIONS: [&str; 13] = [
    "popup",
    "document",
    "doc",
    "elemhide",
    "ehide",
    "generichide",
    "ghide",
    "genericblock",
    "csp",
    "redirect",
    "redirect-rule",
    "rewrite",
    "removeparam",
];

/// Errors loading or parsing filter rules.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A filter list file could not be read.
    #[error("failed to read filter list {path}: {source}\n  Suggestion: run `privacy-scanner update-datasets`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single rule line is malformed; such lines are skipped when loading lists.
    #[error("invalid filter rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(Vec<u8>),
    Wildcard,
    Separator,
}

#[derive(Debug, Clone)]
enum Pattern {
    /// `||host^`, indexed by host.
    Host(String),
    /// `||...` not reducible to a bare host.
    HostAnchored { tokens: Vec<Token>, end_anchor: bool },
    /// Plain pattern, optionally `|`-anchored at either end.
    Glob {
        tokens: Vec<Token>,
        start_anchor: bool,
        end_anchor: bool,
    },
    Regex(Regex),
}

#[derive(Debug, Clone, Default)]
struct RuleOptions {
    third_party: Option<bool>,
    include_domains: Vec<String>,
    exclude_domains: Vec<String>,
    match_case: bool,
}

#[derive(Debug, Clone)]
struct NetworkRule {
    raw: String,
    pattern: Pattern,
    options: RuleOptions,
}

/// Outcome of parsing one line.
enum ParsedLine {
    Skip,
    Rule { rule: NetworkRule, exception: bool },
}

#[derive(Debug, Default)]
struct RuleIndex {
    rules: Vec<NetworkRule>,
    by_host: HashMap<String, Vec<usize>>,
    generic: Vec<usize>,
}

impl RuleIndex {
    fn push(&mut self, rule: NetworkRule) {
        let index = self.rules.len();
        match &rule.pattern {
            Pattern::Host(host) => self.by_host.entry(host.clone()).or_default().push(index),
            _ => self.generic.push(index),
        }
        self.rules.push(rule);
    }

    fn find(&self, request: &RequestContext) -> Option<&NetworkRule> {
        for start in request.label_starts() {
            let suffix = &request.host[start..];
            if let Some(indices) = self.by_host.get(suffix) {
                let hit = indices
                    .iter()
                    .map(|&i| &self.rules[i])
                    .find(|rule| rule.options.applies_to(request));
                if hit.is_some() {
                    return hit;
                }
            }
        }
        self.generic
            .iter()
            .map(|&i| &self.rules[i])
            .find(|rule| rule.options.applies_to(request) && rule.pattern_matches(request))
    }
}

/// Compiled filter rules from one or more lists.
#[derive(Debug, Default)]
pub struct FilterRules {
    blocking: RuleIndex,
    exceptions: RuleIndex,
    invalid: usize,
}

impl FilterRules {
    /// Parses the concatenation of `lists`, skipping malformed lines.
    #[must_use]
    pub fn parse<'a>(lists: impl IntoIterator<Item = &'a str>) -> Self {
        let mut rules = Self::default();
        for list in lists {
            for line in list.lines() {
                match parse_line(line) {
                    Ok(ParsedLine::Skip) => {}
                    Ok(ParsedLine::Rule { rule, exception }) => {
                        if exception {
                            rules.exceptions.push(rule);
                        } else {
                            rules.blocking.push(rule);
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "skipping filter rule");
                        rules.invalid += 1;
                    }
                }
            }
        }
        rules
    }

    /// Reads and parses the given list files.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Io`] if any file cannot be read.
    #[instrument(skip_all, fields(lists = paths.len()))]
    pub fn load_files(paths: &[PathBuf]) -> Result<Self, FilterError> {
        let texts = paths
            .iter()
            .map(|path| read_list(path))
            .collect::<Result<Vec<_>, _>>()?;
        let rules = Self::parse(texts.iter().map(String::as_str));
        info!(
            blocking = rules.blocking.rules.len(),
            exceptions = rules.exceptions.rules.len(),
            invalid = rules.invalid,
            "filter rules loaded"
        );
        Ok(rules)
    }

    /// Number of blocking and exception rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocking.rules.len() + self.exceptions.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines that failed to parse.
    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.invalid
    }

    /// Returns the blocking rule matching `url` loaded from `document_url`,
    /// unless an exception rule also matches.
    ///
    /// `url` may be a bare hostname, which is matched as `http://<host>/`.
    #[must_use]
    pub fn matching_rule(
        &self,
        url: &str,
        document_url: &str,
        domains: &DomainResolver,
    ) -> Option<&str> {
        let request = RequestContext::new(url, document_url, domains);
        let rule = self.blocking.find(&request)?;
        if self.exceptions.find(&request).is_some() {
            return None;
        }
        Some(rule.raw.as_str())
    }

    #[must_use]
    pub fn matches(&self, url: &str, document_url: &str, domains: &DomainResolver) -> bool {
        self.matching_rule(url, document_url, domains).is_some()
    }
}

fn read_list(path: &Path) -> Result<String, FilterError> {
    let bytes = std::fs::read(path).map_err(|source| FilterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn invalid(rule: &str, reason: &str) -> FilterError {
    FilterError::InvalidRule {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

fn is_cosmetic(line: &str) -> bool {
    ["##", "#@#", "#?#", "#$#", "#@?#", "#@$#"]
        .iter()
        .any(|marker| line.contains(marker))
}

fn parse_line(line: &str) -> Result<ParsedLine, FilterError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('!') || line.starts_with('[') || is_cosmetic(line) {
        return Ok(ParsedLine::Skip);
    }

    let (exception, body) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (pattern, options) = split_options(body);
    let Some(options) = parse_options(line, options)? else {
        return Ok(ParsedLine::Skip);
    };
    let pattern = parse_pattern(line, pattern, options.match_case)?;
    Ok(ParsedLine::Rule {
        rule: NetworkRule {
            raw: line.to_string(),
            pattern,
            options,
        },
        exception,
    })
}

fn split_options(body: &str) -> (&str, Option<&str>) {
    if body.len() > 2 && body.starts_with('/') && body.ends_with('/') {
        return (body, None);
    }
    match body.rfind('$') {
        Some(pos)
            if body[pos + 1..]
                .starts_with(|c: char| c.is_ascii_alphabetic() || c == '~' || c == '_') =>
        {
            (&body[..pos], Some(&body[pos + 1..]))
        }
        _ => (body, None),
    }
}

/// `Ok(None)` means the rule is valid but cannot apply to a captured request.
fn parse_options(line: &str, raw: Option<&str>) -> Result<Option<RuleOptions>, FilterError> {
    let mut options = RuleOptions::default();
    let Some(raw) = raw else {
        return Ok(Some(options));
    };
    for option in raw.split(',') {
        let option = option.trim().to_ascii_lowercase();
        let name = option.split('=').next().unwrap_or_default();
        if UNSUPPORTED_OPTIONS.contains(&name) {
            return Ok(None);
        }
        match option.as_str() {
            "third-party" | "3p" => options.third_party = Some(true),
            "~third-party" | "~3p" | "first-party" | "1p" => options.third_party = Some(false),
            "match-case" => options.match_case = true,
            _ => {
                if let Some(domains) = option.strip_prefix("domain=") {
                    for domain in domains.split('|').filter(|d| !d.is_empty()) {
                        match domain.strip_prefix('~') {
                            Some(excluded) => options.exclude_domains.push(excluded.to_string()),
                            None => options.include_domains.push(domain.to_string()),
                        }
                    }
                    if options.include_domains.is_empty() && options.exclude_domains.is_empty() {
                        return Err(invalid(line, "empty domain= option"));
                    }
                }
                // resource-type and other request-independent options are ignored
            }
        }
    }
    Ok(Some(options))
}

fn parse_pattern(line: &str, pattern: &str, match_case: bool) -> Result<Pattern, FilterError> {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let source = &pattern[1..pattern.len() - 1];
        let regex = RegexBuilder::new(source)
            .case_insensitive(!match_case)
            .build()
            .map_err(|err| invalid(line, &err.to_string()))?;
        return Ok(Pattern::Regex(regex));
    }

    let pattern = if match_case {
        pattern.to_string()
    } else {
        pattern.to_ascii_lowercase()
    };
    if pattern.is_empty() {
        return Err(invalid(line, "empty pattern"));
    }

    if let Some(rest) = pattern.strip_prefix("||") {
        let (rest, end_anchor) = strip_end_anchor(rest);
        if rest.is_empty() {
            return Err(invalid(line, "empty host anchor"));
        }
        if !end_anchor
            && let Some(host) = rest.strip_suffix('^')
            && !host.is_empty()
            && host.bytes().all(is_host_byte)
        {
            return Ok(Pattern::Host(host.to_string()));
        }
        return Ok(Pattern::HostAnchored {
            tokens: tokenize(rest),
            end_anchor,
        });
    }

    let (rest, start_anchor) = match pattern.strip_prefix('|') {
        Some(rest) => (rest, true),
        None => (pattern.as_str(), false),
    };
    let (rest, end_anchor) = strip_end_anchor(rest);
    let tokens = tokenize(rest);
    if tokens.is_empty() {
        return Err(invalid(line, "pattern has no tokens"));
    }
    Ok(Pattern::Glob {
        tokens,
        start_anchor,
        end_anchor,
    })
}

fn strip_end_anchor(pattern: &str) -> (&str, bool) {
    match pattern.strip_suffix('|') {
        Some(rest) => (rest, true),
        None => (pattern, false),
    }
}

fn is_host_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_')
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = Vec::new();
    for &b in pattern.as_bytes() {
        let special = match b {
            b'*' => Some(Token::Wildcard),
            b'^' => Some(Token::Separator),
            _ => None,
        };
        match special {
            Some(token) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                // collapse runs of wildcards
                if !(token == Token::Wildcard && tokens.last() == Some(&Token::Wildcard)) {
                    tokens.push(token);
                }
            }
            None => literal.push(b),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn is_separator(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'%') || b >= 0x80)
}

/// Matches `tokens` against a prefix of `text` (the whole of it with `end_anchor`).
fn glob_match(tokens: &[Token], text: &[u8], end_anchor: bool) -> bool {
    GlobMatcher::new(tokens, text, end_anchor).matches_at(0, 0)
}

/// Matches `tokens` starting at any offset of `text`.
fn glob_find(tokens: &[Token], text: &[u8], end_anchor: bool) -> bool {
    let mut matcher = GlobMatcher::new(tokens, text, end_anchor);
    (0..=text.len()).any(|start| matcher.matches_at(0, start))
}

/// Token matcher that visits each (token, offset) state at most once.
struct GlobMatcher<'a> {
    tokens: &'a [Token],
    text: &'a [u8],
    end_anchor: bool,
    failed: Vec<bool>,
    /// Per wildcard token: lowest offset known to fail. Every later offset fails too.
    wildcard_floor: Vec<usize>,
}

impl<'a> GlobMatcher<'a> {
    fn new(tokens: &'a [Token], text: &'a [u8], end_anchor: bool) -> Self {
        Self {
            tokens,
            text,
            end_anchor,
            failed: vec![false; tokens.len() * (text.len() + 1)],
            wildcard_floor: vec![text.len() + 1; tokens.len()],
        }
    }

    fn matches_at(&mut self, token: usize, pos: usize) -> bool {
        let (tokens, text) = (self.tokens, self.text);
        let Some(current) = tokens.get(token) else {
            return !self.end_anchor || pos == text.len();
        };
        let slot = token * (text.len() + 1) + pos;
        if self.failed[slot] {
            return false;
        }
        let matched = match current {
            Token::Wildcard => {
                if token + 1 == tokens.len() {
                    return true;
                }
                let floor = self.wildcard_floor[token];
                let found = (pos..floor).any(|next| self.matches_at(token + 1, next));
                if !found {
                    self.wildcard_floor[token] = floor.min(pos);
                }
                found
            }
            Token::Separator => match text.get(pos) {
                None => self.matches_at(token + 1, pos),
                Some(&b) => is_separator(b) && self.matches_at(token + 1, pos + 1),
            },
            Token::Literal(literal) => {
                text[pos..].starts_with(literal) && self.matches_at(token + 1, pos + literal.len())
            }
        };
        if !matched {
            self.failed[slot] = true;
        }
        matched
    }
}

/// A request as seen by the matcher.
struct RequestContext {
    url: String,
    url_lower: String,
    host: String,
    host_offset: usize,
    document_host: String,
    third_party: bool,
}

impl RequestContext {
    fn new(url: &str, document_url: &str, domains: &DomainResolver) -> Self {
        let url = if url.contains("://") {
            url.to_string()
        } else if url.contains('/') {
            format!("http://{url}")
        } else {
            format!("http://{url}/")
        };
        let url_lower = url.to_ascii_lowercase();
        let (host_offset, host) = host_span(&url_lower);
        let request = domains.parse(&url);
        let document = domains.parse(document_url);
        let third_party = !document.fqdn.is_empty()
            && request.registered_domain != document.registered_domain;
        Self {
            url,
            url_lower,
            host,
            host_offset,
            document_host: document.fqdn,
            third_party,
        }
    }

    /// Offsets into `host` where a label begins.
    fn label_starts(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(0).chain(
            self.host
                .match_indices('.')
                .map(|(i, _)| i + 1)
                .filter(|&i| i < self.host.len()),
        )
    }

    fn text(&self, match_case: bool) -> &[u8] {
        if match_case {
            self.url.as_bytes()
        } else {
            self.url_lower.as_bytes()
        }
    }
}

fn host_span(url: &str) -> (usize, String) {
    let start = url.find("://").map_or(0, |i| i + 3);
    let authority_end = url[start..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |i| start + i);
    let authority = &url[start..authority_end];
    let (offset, host_port) = match authority.rfind('@') {
        Some(at) => (start + at + 1, &authority[at + 1..]),
        None => (start, authority),
    };
    let host = host_port.split(':').next().unwrap_or_default();
    (offset, host.to_string())
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl RuleOptions {
    fn applies_to(&self, request: &RequestContext) -> bool {
        if let Some(third_party) = self.third_party
            && third_party != request.third_party
        {
            return false;
        }
        if !self.include_domains.is_empty()
            && !self
                .include_domains
                .iter()
                .any(|d| domain_matches(&request.document_host, d))
        {
            return false;
        }
        !self
            .exclude_domains
            .iter()
            .any(|d| domain_matches(&request.document_host, d))
    }
}

impl NetworkRule {
    fn pattern_matches(&self, request: &RequestContext) -> bool {
        let text = request.text(self.options.match_case);
        match &self.pattern {
            Pattern::Host(host) => request
                .label_starts()
                .any(|start| &request.host[start..] == host),
            Pattern::HostAnchored { tokens, end_anchor } => request.label_starts().any(|start| {
                glob_match(tokens, &text[request.host_offset + start..], *end_anchor)
            }),
            Pattern::Glob {
                tokens,
                start_anchor: true,
                end_anchor,
            } => glob_match(tokens, text, *end_anchor),
            Pattern::Glob {
                tokens,
                start_anchor: false,
                end_anchor,
            } => glob_find(tokens, text, *end_anchor),
            Pattern::Regex(regex) => regex.is_match(&request.url),
        }
    }
}
