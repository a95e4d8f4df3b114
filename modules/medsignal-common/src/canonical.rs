use anyhow::Result;
use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters always stripped during canonicalization, in addition to
/// the configured set and any `utm_*` key.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &["spm", "from", "share_token", "previous_page"];

/// Canonicalize a report URL for event fingerprinting.
///
/// - lowercases scheme and host, drops default ports (via `Url` parsing)
/// - drops the fragment
/// - strips `utm_*` and configured tracking parameters
/// - sorts the surviving query pairs
/// - removes a trailing slash unless the path is just "/"
///
/// Idempotent: `canonical_url(canonical_url(u)) == canonical_url(u)`.
pub fn canonical_url(raw: &str, tracking_params: &[String]) -> Result<String> {
    let mut parsed = Url::parse(raw.trim())?;

    parsed.set_fragment(None);

    if let Some(query) = parsed.query() {
        if !query.is_empty() {
            let mut pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .filter(|(k, _)| !is_tracking_param(k, tracking_params))
                .collect();
            pairs.sort();
            if pairs.is_empty() {
                parsed.set_query(None);
            } else {
                let sorted: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| {
                        if v.is_empty() {
                            k.clone()
                        } else {
                            format!("{k}={v}")
                        }
                    })
                    .collect();
                parsed.set_query(Some(&sorted.join("&")));
            }
        } else {
            parsed.set_query(None);
        }
    }

    let mut result = parsed.to_string();
    if result.ends_with('/') && parsed.path() != "/" {
        result.pop();
    }

    Ok(result)
}

fn is_tracking_param(key: &str, configured: &[String]) -> bool {
    if key.starts_with("utm_") {
        return true;
    }
    if DEFAULT_TRACKING_PARAMS.contains(&key) {
        return true;
    }
    configured.iter().any(|p| p == key)
}

/// Normalize a hospital name for fingerprinting: trim, collapse internal
/// whitespace, and strip the plan-label suffix the mail body sometimes
/// leaks into the name.
pub fn normalize_hospital(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .strip_suffix("方案")
        .unwrap_or(&collapsed)
        .to_string()
}

/// 64-bit unsigned event fingerprint over (canonical URL, normalized
/// hospital). First 8 bytes of SHA-256, big-endian.
pub fn event_fingerprint(canonical_url: &str, hospital: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_hospital(hospital).as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(u: &str) -> String {
        canonical_url(u, &[]).unwrap()
    }

    #[test]
    fn strips_utm_and_tracking_params() {
        assert_eq!(
            canon("https://vendor.example/r?id=abc&utm_source=x&spm=foo"),
            "https://vendor.example/r?id=abc"
        );
    }

    #[test]
    fn strips_configured_params() {
        let extra = vec!["ref".to_string()];
        assert_eq!(
            canonical_url("https://vendor.example/r?id=abc&ref=mail", &extra).unwrap(),
            "https://vendor.example/r?id=abc"
        );
    }

    #[test]
    fn sorts_remaining_query_keys() {
        assert_eq!(
            canon("https://vendor.example/r?b=2&a=1"),
            "https://vendor.example/r?a=1&b=2"
        );
    }

    #[test]
    fn drops_fragment_and_default_port() {
        assert_eq!(
            canon("HTTPS://Vendor.Example:443/r?id=abc#section"),
            "https://vendor.example/r?id=abc"
        );
    }

    #[test]
    fn removes_trailing_slash_except_root() {
        assert_eq!(canon("https://vendor.example/r/"), "https://vendor.example/r");
        assert_eq!(canon("https://vendor.example/"), "https://vendor.example/");
    }

    #[test]
    fn all_params_tracking_leaves_no_query() {
        assert_eq!(
            canon("https://vendor.example/r?utm_source=x&utm_medium=y"),
            "https://vendor.example/r"
        );
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "https://vendor.example/r?id=abc&utm_source=x",
            "https://vendor.example/path/?b=2&a=1#frag",
            "https://vendor.example/",
            "https://vendor.example/r?spm=a.b.c",
        ];
        for raw in inputs {
            let once = canon(raw);
            assert_eq!(canon(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn same_canonical_url_same_fingerprint() {
        let a = canon("https://vendor.example/r?id=abc&utm_source=x");
        let b = canon("https://vendor.example/r?id=abc&spm=foo");
        assert_eq!(a, b);
        assert_eq!(
            event_fingerprint(&a, "市一医院"),
            event_fingerprint(&b, "市一医院")
        );
    }

    #[test]
    fn fingerprint_varies_by_hospital() {
        let url = "https://vendor.example/r?id=abc";
        assert_ne!(
            event_fingerprint(url, "市一医院"),
            event_fingerprint(url, "市二医院")
        );
    }

    #[test]
    fn hospital_normalization_collapses_whitespace() {
        assert_eq!(normalize_hospital("  市一  医院 "), "市一 医院");
        assert_eq!(normalize_hospital("市一医院方案"), "市一医院");
    }

    #[test]
    fn fingerprint_ignores_hospital_whitespace() {
        let url = "https://vendor.example/r?id=abc";
        assert_eq!(
            event_fingerprint(url, " 市一医院 "),
            event_fingerprint(url, "市一医院")
        );
    }
}
