//! Source URL canonicalization and event fingerprints.
//!
//! Both feed the natural keys of the event store: the same story reported
//! twice by one outlet collapses to one `(event_id, canonical_url)` row, and
//! the same story reported by two outlets collapses to one event with two
//! sources.

use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Category;

/// Query parameters that never identify content.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref", "ref_src"];

/// A canonicalized source URL and its domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSource {
    pub canonical_url: String,
    pub domain: String,
}

/// Canonicalize a source URL.
///
/// Lowercases the host, drops a leading `www.`, the fragment, tracking
/// parameters and a trailing slash. Only http(s) URLs are accepted.
pub fn canonicalize_url(raw: &str) -> Result<CanonicalSource> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::InvalidInput(format!("invalid source url {raw:?}: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::InvalidInput(format!(
            "unsupported source url scheme: {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidInput(format!("source url has no host: {raw}")))?
        .to_ascii_lowercase();
    let domain = host.strip_prefix("www.").unwrap_or(&host).to_string();
    url.set_host(Some(&domain))
        .map_err(|e| Error::InvalidInput(format!("invalid source host {domain:?}: {e}")))?;

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut canonical_url: String = url.into();
    if canonical_url.ends_with('/') && !canonical_url.contains('?') {
        canonical_url.pop();
    }

    Ok(CanonicalSource {
        canonical_url,
        domain,
    })
}

/// Collapse whitespace and case so near-identical headlines match.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic event id for a brand, category and headline.
///
/// Re-ingesting the same story yields the same id, which makes event insertion
/// an idempotent upsert.
pub fn event_fingerprint(brand_id: Uuid, category: Category, title: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(brand_id.as_bytes());
    hasher.update(category.as_str().as_bytes());
    hasher.update(normalize_title(title).as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Hex digest of a canonical URL, used in log fields instead of the URL itself.
pub fn url_digest(canonical_url: &str) -> String {
    hex::encode(&Sha256::digest(canonical_url.as_bytes())[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_www_fragment_tracking() {
        let src = canonicalize_url(
            "https://WWW.News.Example.com/world/story-1/?utm_source=x&id=7&fbclid=abc#top",
        )
        .unwrap();
        assert_eq!(src.domain, "news.example.com");
        assert_eq!(src.canonical_url, "https://news.example.com/world/story-1?id=7");
    }

    #[test]
    fn test_canonicalize_drops_empty_query_and_root_slash() {
        let src = canonicalize_url("http://example.org/?utm_medium=email").unwrap();
        assert_eq!(src.canonical_url, "http://example.org");
        assert_eq!(src.domain, "example.org");
    }

    #[test]
    fn test_canonicalize_same_story_same_url() {
        let a = canonicalize_url("https://www.example.org/a/b/").unwrap();
        let b = canonicalize_url("https://example.org/a/b#comments").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert!(canonicalize_url("ftp://example.org/file").is_err());
        assert!(canonicalize_url("not a url").is_err());
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("  Factory   FIRE: workers hurt! "),
            "factory fire workers hurt"
        );
    }

    #[test]
    fn test_fingerprint_stable_across_formatting() {
        let brand = Uuid::new_v4();
        let a = event_fingerprint(brand, Category::Labor, "Factory fire: workers hurt");
        let b = event_fingerprint(brand, Category::Labor, "factory FIRE  workers hurt");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_differs_by_brand_and_category() {
        let brand = Uuid::new_v4();
        let a = event_fingerprint(brand, Category::Labor, "Recall");
        assert_ne!(a, event_fingerprint(brand, Category::Social, "Recall"));
        assert_ne!(a, event_fingerprint(Uuid::new_v4(), Category::Labor, "Recall"));
    }

    #[test]
    fn test_url_digest_is_short_hex() {
        let d = url_digest("https://example.org/a");
        assert_eq!(d.len(), 16);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
