//! Content fetcher: downloads article HTML and extracts the main text.
//!
//! Known-restricted domains (paywalls, JavaScript-only sites) are rejected
//! before any network call. Responses are bounded in time and size, and the
//! Readability extraction runs on a blocking thread because it is CPU-bound.
//! Every failure carries a [`FetchErrorKind`] so callers can branch on
//! retriability.

use std::time::Duration;

use crate::normalize::domain_of;

/// Classification of fetch failures. Retriability decides whether the
/// per-domain rate limiter backs off and whether the persisted failure can
/// be cleared in bulk for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    Timeout,
    Http4xx,
    Http5xx,
    Paywall,
    JsRequired,
    ExtractionFailed,
    ConnectionError,
    NoContent,
}

impl FetchErrorKind {
    pub const ALL: [FetchErrorKind; 8] = [
        FetchErrorKind::Timeout,
        FetchErrorKind::Http4xx,
        FetchErrorKind::Http5xx,
        FetchErrorKind::Paywall,
        FetchErrorKind::JsRequired,
        FetchErrorKind::ExtractionFailed,
        FetchErrorKind::ConnectionError,
        FetchErrorKind::NoContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Http4xx => "http_4xx",
            FetchErrorKind::Http5xx => "http_5xx",
            FetchErrorKind::Paywall => "paywall",
            FetchErrorKind::JsRequired => "js_required",
            FetchErrorKind::ExtractionFailed => "extraction_failed",
            FetchErrorKind::ConnectionError => "connection_error",
            FetchErrorKind::NoContent => "no_content",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    pub fn retriable(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::Timeout | FetchErrorKind::Http5xx | FetchErrorKind::ConnectionError
        )
    }
}

/// Result of a content fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub success: bool,
    pub fulltext: Option<String>,
    pub char_count: usize,
    pub error_kind: Option<FetchErrorKind>,
    pub error_message: Option<String>,
    pub http_status: Option<u16>,
}

impl FetchOutcome {
    fn ok(fulltext: String, http_status: u16) -> Self {
        FetchOutcome {
            char_count: fulltext.len(),
            success: true,
            fulltext: Some(fulltext),
            error_kind: None,
            error_message: None,
            http_status: Some(http_status),
        }
    }

    fn err(kind: FetchErrorKind, message: impl Into<String>, http_status: Option<u16>) -> Self {
        FetchOutcome {
            success: false,
            fulltext: None,
            char_count: 0,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            http_status,
        }
    }

    pub fn retriable(&self) -> bool {
        self.error_kind.map(|k| k.retriable()).unwrap_or(false)
    }
}

/// Domains behind hard paywalls. Fetching them wastes a request and pollutes
/// the failure table with retriable-looking errors.
const PAYWALL_DOMAINS: &[&str] = &[
    "medium.com",
    "nytimes.com",
    "wsj.com",
    "ft.com",
    "economist.com",
    "bloomberg.com",
    "washingtonpost.com",
    "theathletic.com",
    "businessinsider.com",
    "seekingalpha.com",
];

/// Domains that only render content client-side.
const JS_REQUIRED_DOMAINS: &[&str] = &[
    "twitter.com",
    "x.com",
    "instagram.com",
    "facebook.com",
    "linkedin.com",
];

/// Extractions shorter than this are treated as failed.
pub const MIN_CONTENT_LENGTH: usize = 200;
/// Response body cap.
pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;
/// Per-request timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches article content and extracts the readable text.
pub struct ContentFetcher {
    http: reqwest::Client,
}

impl ContentFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".parse()?,
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            "en-US,en;q=0.9,de;q=0.8".parse()?,
        );

        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("Mozilla/5.0 (compatible; Clippings/0.3; +https://github.com/parallax-labs/clippings)")
            .default_headers(headers)
            .build()?;

        Ok(ContentFetcher { http })
    }

    /// Fetch and extract content from a URL.
    pub async fn fetch(&self, url: &str) -> FetchOutcome {
        if let Some(restricted) = check_domain_restrictions(url) {
            return restricted;
        }

        let response = match self.http.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => return classify_request_error(&e),
        };

        let status = response.status().as_u16();
        if status >= 500 {
            return FetchOutcome::err(
                FetchErrorKind::Http5xx,
                format!("Server error: {}", status),
                Some(status),
            );
        }
        if status >= 400 {
            return FetchOutcome::err(
                FetchErrorKind::Http4xx,
                format!("Client error: {}", status),
                Some(status),
            );
        }

        if let Some(length) = response.content_length() {
            if length as usize > MAX_CONTENT_SIZE {
                return FetchOutcome::err(
                    FetchErrorKind::ExtractionFailed,
                    format!("Content too large: {} bytes", length),
                    Some(status),
                );
            }
        }

        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return classify_request_error(&e),
        };
        if body.len() > MAX_CONTENT_SIZE {
            return FetchOutcome::err(
                FetchErrorKind::ExtractionFailed,
                format!("Content too large: {} bytes", body.len()),
                Some(status),
            );
        }

        let html = String::from_utf8_lossy(&body).into_owned();

        // Readability is CPU-bound; keep it off the async workers.
        let extracted = tokio::task::spawn_blocking(move || extract_article_text(html)).await;

        match extracted {
            Ok(Ok(Some(text))) if text.len() >= MIN_CONTENT_LENGTH => {
                FetchOutcome::ok(text, status)
            }
            Ok(Ok(Some(text))) => FetchOutcome::err(
                FetchErrorKind::ExtractionFailed,
                format!("Content too short: {} chars", text.len()),
                Some(status),
            ),
            Ok(Ok(None)) => FetchOutcome::err(
                FetchErrorKind::NoContent,
                "No content could be extracted",
                Some(status),
            ),
            Ok(Err(e)) => FetchOutcome::err(
                FetchErrorKind::ExtractionFailed,
                format!("Extraction error: {}", e),
                Some(status),
            ),
            Err(e) => FetchOutcome::err(
                FetchErrorKind::ExtractionFailed,
                format!("Extraction task failed: {}", e),
                Some(status),
            ),
        }
    }
}

/// Pre-network check against the static domain sets.
fn check_domain_restrictions(url: &str) -> Option<FetchOutcome> {
    let domain = domain_of(url);

    for paywall in PAYWALL_DOMAINS {
        if domain == *paywall || domain.ends_with(&format!(".{}", paywall)) {
            return Some(FetchOutcome::err(
                FetchErrorKind::Paywall,
                format!("Domain {} requires subscription", domain),
                None,
            ));
        }
    }

    for js in JS_REQUIRED_DOMAINS {
        if domain == *js || domain.ends_with(&format!(".{}", js)) {
            return Some(FetchOutcome::err(
                FetchErrorKind::JsRequired,
                format!("Domain {} requires JavaScript rendering", domain),
                None,
            ));
        }
    }

    None
}

fn classify_request_error(e: &reqwest::Error) -> FetchOutcome {
    if e.is_timeout() {
        FetchOutcome::err(
            FetchErrorKind::Timeout,
            format!("Request timed out after {}s", FETCH_TIMEOUT.as_secs()),
            None,
        )
    } else if e.is_connect() {
        FetchOutcome::err(
            FetchErrorKind::ConnectionError,
            format!("Connection error: {}", e),
            None,
        )
    } else {
        FetchOutcome::err(
            FetchErrorKind::ExtractionFailed,
            format!("Unexpected error: {}", e),
            e.status().map(|s| s.as_u16()),
        )
    }
}

/// Run Readability over the raw HTML. Returns `Ok(None)` when the extractor
/// found nothing usable.
fn extract_article_text(html: String) -> Result<Option<String>, dom_smoothie::ReadabilityError> {
    let config = dom_smoothie::Config {
        text_mode: dom_smoothie::TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = dom_smoothie::Readability::new(html, None, Some(config))?;
    let article = readability.parse()?;

    let text = article.text_content.trim().to_string();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paywall_blocked_without_network() {
        let outcome = check_domain_restrictions("https://www.nytimes.com/2024/01/01/x.html")
            .expect("nytimes should be restricted");
        assert_eq!(outcome.error_kind, Some(FetchErrorKind::Paywall));
        assert!(!outcome.retriable());
    }

    #[test]
    fn test_paywall_subdomain_blocked() {
        let outcome = check_domain_restrictions("https://cooking.nytimes.com/recipes/1")
            .expect("subdomain should be restricted");
        assert_eq!(outcome.error_kind, Some(FetchErrorKind::Paywall));
    }

    #[test]
    fn test_js_domain_blocked() {
        let outcome =
            check_domain_restrictions("https://x.com/someone/status/1").expect("restricted");
        assert_eq!(outcome.error_kind, Some(FetchErrorKind::JsRequired));
        assert!(!outcome.retriable());
    }

    #[test]
    fn test_normal_domain_allowed() {
        assert!(check_domain_restrictions("https://en.wikipedia.org/wiki/Rust").is_none());
    }

    #[test]
    fn test_suffix_match_requires_dot_boundary() {
        // notnytimes.com is not a subdomain of nytimes.com
        assert!(check_domain_restrictions("https://notnytimes.com/a").is_none());
    }

    #[test]
    fn test_retriability_table() {
        assert!(FetchErrorKind::Timeout.retriable());
        assert!(FetchErrorKind::Http5xx.retriable());
        assert!(FetchErrorKind::ConnectionError.retriable());
        assert!(!FetchErrorKind::Http4xx.retriable());
        assert!(!FetchErrorKind::Paywall.retriable());
        assert!(!FetchErrorKind::JsRequired.retriable());
        assert!(!FetchErrorKind::ExtractionFailed.retriable());
        assert!(!FetchErrorKind::NoContent.retriable());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in FetchErrorKind::ALL {
            assert_eq!(FetchErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FetchErrorKind::parse("bogus"), None);
    }
}
