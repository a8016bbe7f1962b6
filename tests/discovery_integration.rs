//! Link discovery over saved HTML pages.

use serde_json::json;

use scanner_core::discovery::extract_link;
use scanner_core::{HtmlSnapshotDocument, LinkDiscovery, LinkTarget, ResultStore, ScanResult};

const FINAL_URL: &str = "https://www.example.com/shop/index.html";

#[tokio::test]
async fn test_higher_priority_keyword_wins() {
    let document = HtmlSnapshotDocument::parse(
        r#"<html><body>
        <nav><a href="/privacy-faq">Privacy</a></nav>
        <footer><a href="/legal/privacy">Privacy Policy</a></footer>
        </body></html>"#,
    );
    let target = LinkTarget::new([("privacy policy", 0), ("privacy", 2)], "privacy_policy_url");
    let mut store = ScanResult::new();

    let best = extract_link(&mut store, &document, &target, FINAL_URL, false)
        .await
        .unwrap();
    assert_eq!(best.keyword, "privacy policy");
    assert_eq!(best.priority, 0);
    assert_eq!(
        store.get("privacy_policy_url"),
        Some(&json!("https://www.example.com/legal/privacy"))
    );
    assert_eq!(store.get("privacy_policy_url_keyword"), Some(&json!("privacy policy")));
    assert!(!document.scripts_disabled());
}

#[tokio::test]
async fn test_lower_priority_keyword_is_used_when_alone() {
    let document =
        HtmlSnapshotDocument::parse(r#"<footer><a href="privacy.html">Your privacy</a></footer>"#);
    let target = LinkTarget::new([("privacy policy", 0), ("privacy", 2)], "privacy_policy_url");
    let mut store = ScanResult::new();

    let best = extract_link(&mut store, &document, &target, FINAL_URL, false)
        .await
        .unwrap();
    assert_eq!(best.priority, 2);
    assert_eq!(
        store.get("privacy_policy_url"),
        Some(&json!("https://www.example.com/shop/privacy.html"))
    );
}

#[tokio::test]
async fn test_hidden_links_are_skipped_by_text_search() {
    let document = HtmlSnapshotDocument::parse(
        r#"<div style="display:none"><a href="/old-policy">Privacy Policy</a></div>
        <p><a href="/dp">Privacy Policy</a></p>"#,
    );
    let candidates = LinkDiscovery::new(&document)
        .candidates(&LinkTarget::privacy_policy())
        .await;
    assert_eq!(candidates[0].url, "/dp");
    assert!(candidates.iter().all(|c| c.url != "/old-policy"));
}

#[tokio::test]
async fn test_markup_scan_finds_keyword_outside_text() {
    let document = HtmlSnapshotDocument::parse(
        r#"<footer><a href="/dsgvo" title="Datenschutz"><img src="lock.svg"></a></footer>"#,
    );
    let mut store = ScanResult::new();
    let best = extract_link(&mut store, &document, &LinkTarget::privacy_policy(), FINAL_URL, false)
        .await
        .unwrap();
    assert_eq!(best.keyword, "Datenschutz");
    assert_eq!(store.get("privacy_policy_url"), Some(&json!("https://www.example.com/dsgvo")));
}

#[tokio::test]
async fn test_no_match_writes_nulls() {
    let document = HtmlSnapshotDocument::parse("<p>Nothing to see</p>");
    let mut store = ScanResult::new();
    let best = extract_link(&mut store, &document, &LinkTarget::imprint(), FINAL_URL, true).await;
    assert!(best.is_none());
    assert_eq!(store.get("imprint_url"), Some(&serde_json::Value::Null));
    assert_eq!(store.get("imprint_url_keyword"), Some(&serde_json::Value::Null));
    assert!(store.dirty_keys().is_empty());
}

#[tokio::test]
async fn test_german_imprint_link_with_scheme_relative_href() {
    let document = HtmlSnapshotDocument::parse(
        r#"<footer><a href="//corp.example.com/impressum">Impressum</a></footer>"#,
    );
    let mut store = ScanResult::new();
    extract_link(&mut store, &document, &LinkTarget::imprint(), FINAL_URL, false).await;
    assert_eq!(
        store.get("imprint_url"),
        Some(&json!("https://corp.example.com/impressum"))
    );
    assert_eq!(store.get("imprint_url_keyword"), Some(&json!("impressum")));
}
