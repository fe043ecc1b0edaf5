//! Normalization rules for URLs, highlight text, and categories.
//!
//! Deduplication across the two upstream endpoints hinges on these functions:
//! documents merge by canonical URL, highlights merge by a 16-hex-char hash
//! over folded text. Both operations are idempotent, which is what makes
//! re-imports produce zero new rows.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use url::Url;

/// Canonical form of a document URL: lowercased, scheme forced to https,
/// leading `www.` stripped, trailing slash stripped, query and fragment
/// dropped. Unparseable input falls back to a lowercased trim.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(_) => return trimmed.to_ascii_lowercase(),
    };

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let path = parsed.path().to_ascii_lowercase();
    let path = path.trim_end_matches('/');

    match parsed.port() {
        Some(port) => format!("https://{}:{}{}", host, port, path),
        None => format!("https://{}{}", host, path),
    }
}

/// Registrable domain of a URL: lowercased host without a leading `www.`.
/// Used by the content fetcher's domain sets and the per-domain rate limiter.
pub fn domain_of(url: &str) -> String {
    let host = Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Fold highlight text for hashing: NFC-normalize, collapse whitespace runs
/// to single spaces, trim.
pub fn fold_highlight_text(text: &str) -> String {
    let normalized: String = text.nfc().collect();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 16 hex chars of SHA-256 over the folded text.
pub fn text_hash16(text: &str) -> String {
    let folded = fold_highlight_text(text);
    let mut hasher = Sha256::new();
    hasher.update(folded.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Plural category names from the export endpoint mapped to singular.
const PLURAL_TO_SINGULAR: &[(&str, &str)] = &[
    ("articles", "article"),
    ("podcasts", "podcast"),
    ("tweets", "tweet"),
    ("books", "book"),
];

/// Normalize a category to singular lowercase.
///
/// A linkedin.com URL forces the synthetic `linkedin` category; missing or
/// empty categories default to `article`.
pub fn normalize_category(category: Option<&str>, url: Option<&str>) -> String {
    if let Some(u) = url {
        if u.to_ascii_lowercase().contains("linkedin.com") {
            return "linkedin".to_string();
        }
    }

    let cat = match category {
        Some(c) if !c.trim().is_empty() => c.trim().to_ascii_lowercase(),
        _ => return "article".to_string(),
    };

    for (plural, singular) in PLURAL_TO_SINGULAR {
        if cat == *plural {
            return (*singular).to_string();
        }
    }
    cat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_url_scheme_and_case() {
        assert_eq!(
            canonical_url("http://Example.com/A/"),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_canonical_url_strips_www_query_fragment() {
        assert_eq!(
            canonical_url("https://www.example.com/a/?utm=1#top"),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_canonical_url_root() {
        assert_eq!(canonical_url("https://example.com/"), "https://example.com");
    }

    #[test]
    fn test_canonical_url_idempotent() {
        let once = canonical_url("HTTP://WWW.Example.com/Path/?q=1");
        assert_eq!(canonical_url(&once), once);
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://www.nytimes.com/2024/x"), "nytimes.com");
        assert_eq!(domain_of("https://en.wikipedia.org/wiki/Rust"), "en.wikipedia.org");
    }

    #[test]
    fn test_fold_collapses_whitespace() {
        assert_eq!(fold_highlight_text("  Hello\n\t world  "), "Hello world");
    }

    #[test]
    fn test_text_hash16_length_and_stability() {
        let h = text_hash16("Hello.");
        assert_eq!(h.len(), 16);
        assert_eq!(h, text_hash16("  Hello.  "));
        assert_eq!(h, text_hash16(&fold_highlight_text("Hello.")));
    }

    #[test]
    fn test_text_hash16_distinguishes() {
        assert_ne!(text_hash16("alpha"), text_hash16("beta"));
    }

    #[test]
    fn test_normalize_category_plural() {
        assert_eq!(normalize_category(Some("Articles"), None), "article");
        assert_eq!(normalize_category(Some("tweets"), None), "tweet");
    }

    #[test]
    fn test_normalize_category_linkedin_rule() {
        assert_eq!(
            normalize_category(Some("article"), Some("https://www.LinkedIn.com/posts/x")),
            "linkedin"
        );
    }

    #[test]
    fn test_normalize_category_default() {
        assert_eq!(normalize_category(None, None), "article");
        assert_eq!(normalize_category(Some("  "), None), "article");
    }
}
