//! Integration tests for reference dataset refresh and loading.

use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scanner_core::{
    AttributionSource, DatasetError, DatasetOptions, DomainResolver, ReferenceData, RefreshOutcome,
    update_all,
};

const SUFFIX_LIST: &str = "// test list\n// ===BEGIN ICANN DOMAINS===\ncom\nnet\norg\nco.uk\n";

const SERVICES: &str = r#"{
    "categories": {
        "Analytics": [
            {"Acme Analytics": {"https://www.acme.net/": ["acme.net"], "performance": "true"}}
        ]
    }
}"#;

const EASYLIST: &str = "[Adblock Plus 2.0]\n! Title: test\n||ads.example.net^\n";

fn radar_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (member, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, member, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn default_archive() -> Vec<u8> {
    radar_archive(&[
        ("tracker-radar-master/README.md", "# readme"),
        (
            "tracker-radar-master/domains/US/acme.net.json",
            r#"{"domain":"acme.net","owner":{"name":"Acme Inc.","displayName":"Acme"},"categories":["Analytics"]}"#,
        ),
        (
            "tracker-radar-master/domains/US/cdn.example.org.json",
            r#"{"domain":"cdn.example.org","owner":{"name":"Example Org"},"categories":[]}"#,
        ),
        ("tracker-radar-master/entities/Acme Inc..json", "{}"),
    ])
}

async fn mount(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

async fn serve_all(server: &MockServer, archive: Vec<u8>) {
    mount(server, "/public_suffix_list.dat", SUFFIX_LIST.into()).await;
    mount(server, "/services.json", SERVICES.into()).await;
    for name in ["easylist.txt", "easyprivacy.txt", "fanboy-annoyance.txt"] {
        mount(server, &format!("/easylist/{name}"), EASYLIST.into()).await;
    }
    mount(server, "/tracker-radar.tar.gz", archive).await;
}

fn options(server: &MockServer, storage: &Path) -> DatasetOptions {
    let mut options = DatasetOptions::new(storage);
    options.public_suffix_url = format!("{}/public_suffix_list.dat", server.uri());
    options.services_url = format!("{}/services.json", server.uri());
    options.easylist_url_prefix = format!("{}/easylist/", server.uri());
    options.tracker_radar_url = format!("{}/tracker-radar.tar.gz", server.uri());
    options.tracker_radar_min_files = 2;
    options
}

#[tokio::test]
async fn test_update_all_downloads_every_dataset() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());

    let outcomes = update_all(&options, false).await.unwrap();
    assert!(outcomes.iter().all(|(_, outcome)| *outcome == RefreshOutcome::Updated));

    assert_eq!(
        std::fs::read_to_string(options.public_suffix_path()).unwrap(),
        SUFFIX_LIST
    );
    for list in options.easylist_paths() {
        assert!(list.exists(), "{} missing", list.display());
    }

    let radar = options.tracker_radar_dir();
    let mut names: Vec<String> = std::fs::read_dir(&radar)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["acme.net.json", "canary", "cdn.example.org.json"]);
}

#[tokio::test]
async fn test_services_are_normalized_on_refresh() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());
    update_all(&options, false).await.unwrap();

    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(options.services_path()).unwrap()).unwrap();
    let company = &stored["categories"]["Analytics"][0]["Acme Analytics"];
    assert_eq!(company["www.acme.net"], serde_json::json!(["acme.net"]));
    assert!(company.get("performance").is_none());
    assert!(company.get("https://www.acme.net/").is_none());
}

#[tokio::test]
async fn test_fresh_datasets_are_not_downloaded_again() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());
    update_all(&options, false).await.unwrap();
    let first_round = server.received_requests().await.unwrap().len();

    let outcomes = update_all(&options, false).await.unwrap();
    assert!(outcomes.iter().all(|(_, outcome)| *outcome == RefreshOutcome::Fresh));
    assert_eq!(server.received_requests().await.unwrap().len(), first_round);

    let forced = update_all(&options, true).await.unwrap();
    assert!(forced.iter().all(|(_, outcome)| *outcome == RefreshOutcome::Updated));
}

#[tokio::test]
async fn test_hash_mismatch_keeps_previous_dataset() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let mut options = options(&server, storage.path());
    std::fs::write(options.public_suffix_path(), "org\n").unwrap();
    options
        .checksums
        .insert(options.public_suffix_url.clone(), "00".repeat(32));

    let err = update_all(&options, true).await.unwrap_err();
    assert!(matches!(err, DatasetError::HashMismatch { .. }), "{err}");
    assert_eq!(std::fs::read_to_string(options.public_suffix_path()).unwrap(), "org\n");
}

#[tokio::test]
async fn test_matching_hash_is_accepted() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let mut options = options(&server, storage.path());
    let digest = format!("{:x}", Sha256::digest(SUFFIX_LIST.as_bytes()));
    options.checksums.insert(options.public_suffix_url.clone(), digest);

    update_all(&options, false).await.unwrap();
    assert!(options.public_suffix_path().exists());
}

#[tokio::test]
async fn test_http_error_fails_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());

    let err = update_all(&options, false).await.unwrap_err();
    assert!(matches!(err, DatasetError::HttpStatus { status: 404, .. }), "{err}");
    assert!(err.to_string().contains("Suggestion"));
}

#[tokio::test]
async fn test_invalid_suffix_list_is_not_written() {
    let server = MockServer::start().await;
    mount(&server, "/public_suffix_list.dat", b"// only comments\n".to_vec()).await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());

    let err = update_all(&options, false).await.unwrap_err();
    assert!(matches!(err, DatasetError::PublicSuffix(_)), "{err}");
    assert!(!options.public_suffix_path().exists());
}

#[tokio::test]
async fn test_archive_with_too_few_records_keeps_old_directory() {
    let server = MockServer::start().await;
    serve_all(
        &server,
        radar_archive(&[("tracker-radar-master/domains/US/only.net.json", "{}")]),
    )
    .await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());
    let radar = options.tracker_radar_dir();
    std::fs::create_dir_all(&radar).unwrap();
    std::fs::write(radar.join("previous.net.json"), "{}").unwrap();

    let err = update_all(&options, false).await.unwrap_err();
    assert!(matches!(err, DatasetError::Archive { .. }), "{err}");
    assert!(radar.join("previous.net.json").exists());
    assert!(!storage.path().join("tracker-radar.tmp").exists());
}

#[tokio::test]
async fn test_reference_data_loads_refreshed_datasets() {
    let server = MockServer::start().await;
    serve_all(&server, default_archive()).await;
    let storage = tempfile::tempdir().unwrap();
    let options = options(&server, storage.path());
    update_all(&options, false).await.unwrap();

    let data = ReferenceData::new(options);
    let domains: &DomainResolver = data.domains().unwrap();
    assert_eq!(domains.registered_domain("https://a.b.example.co.uk/"), "example.co.uk");
    assert!(data.filter_rules().unwrap().matches(
        "https://ads.example.net/banner.js",
        "https://shop.com/",
        domains
    ));

    let fqdns = vec!["px.acme.net".to_string(), "unknown.org".to_string()];
    let homepage = data.homepage_list().unwrap().attribute(&fqdns, domains).await;
    assert!(homepage.owners["Acme Analytics"].fqdns.contains("px.acme.net"));

    let radar = data.tracker_radar().unwrap().attribute(&fqdns, domains).await;
    assert_eq!(radar.owners["Acme Inc."].display_name.as_deref(), Some("Acme"));
    assert_eq!(radar.unrecognized_fqdns, ["unknown.org"]);
}
