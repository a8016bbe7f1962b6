//! User-Agent string for dataset downloads.
//!
//! Dataset hosts see the tool name, version and a project URL (RFC 9308).

const PROJECT_UA_URL: &str = "https://github.com/privacy-scanner/privacy-scanner";

/// User-Agent sent when refreshing reference datasets.
#[must_use]
pub(crate) fn dataset_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("privacy-scanner/{version} (dataset-refresh; +{PROJECT_UA_URL})")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_user_agent_format() {
        let ua = dataset_user_agent();
        assert!(ua.contains(PROJECT_UA_URL));
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("privacy-scanner/")
                .and_then(|s| s.split(' ').next())
                .unwrap()
        );
    }
}
