use regex::Regex;
use url::Url;

/// Number of non-empty path segments in a URL.
pub fn url_depth(raw: &str) -> usize {
    match Url::parse(raw) {
        Ok(parsed) => parsed
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .count(),
        Err(_) => 0,
    }
}

/// Depth budget for a crawl, relative to the seed URL's own path depth. A
/// seed at depth 3 with a configured max of 2 permits depths 3..5.
pub fn adjusted_max_depth(seed: &str, configured: usize) -> usize {
    url_depth(seed) + configured
}

/// Canonical form used for fetching: fragment stripped, host lowercased
/// (the url crate does this on parse), trailing slash dropped except at
/// the root. Unparseable input is returned as-is.
pub fn normalize_url(raw: &str) -> String {
    let mut parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(_) => return raw.to_string(),
    };

    parsed.set_fragment(None);

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    parsed.to_string()
}

/// Comparison key for the lock set: the normalized URL with any `www.`
/// prefix collapsed, so `//www.host/` and `//host/` claim the same slot.
/// The canonical URL is preserved separately for fetching.
pub fn lock_key(raw: &str) -> String {
    let normalized = normalize_url(raw);
    let mut parsed = match Url::parse(&normalized) {
        Ok(parsed) => parsed,
        Err(_) => return normalized,
    };

    if let Some(host) = parsed.host_str() {
        if let Some(stripped) = host.strip_prefix("www.") {
            let stripped = stripped.to_string();
            if parsed.set_host(Some(&stripped)).is_err() {
                return normalized;
            }
        }
    }

    parsed.to_string()
}

/// Include/exclude evaluation over the URL's path component only.
/// Excludes veto first; when the include set is non-empty, at least one
/// include must match.
pub fn matches_patterns(path: &str, includes: &[Regex], excludes: &[Regex]) -> bool {
    if excludes.iter().any(|pattern| pattern.is_match(path)) {
        return false;
    }

    if !includes.is_empty() && !includes.iter().any(|pattern| pattern.is_match(path)) {
        return false;
    }

    true
}

/// Extensions routed to the document extractor rather than the renderer.
pub fn is_binary_document(raw: &str) -> bool {
    let path = match Url::parse(raw) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => raw.to_lowercase(),
    };
    path.ends_with(".pdf") || path.ends_with(".doc") || path.ends_with(".docx")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_depth() {
        assert_eq!(url_depth("https://h/a/b/c"), 3);
        assert_eq!(url_depth("https://h/"), 0);
        assert_eq!(url_depth("https://h"), 0);
        assert_eq!(url_depth("https://h/a/"), 1);
    }

    #[test]
    fn test_adjusted_max_depth() {
        assert_eq!(adjusted_max_depth("https://h/a/b", 2), 4);
        assert_eq!(adjusted_max_depth("https://h/", 3), 3);
    }

    #[test]
    fn test_normalize_strips_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://Example.com/Page/#section"),
            "https://example.com/Page"
        );
        assert_eq!(normalize_url("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "https://example.com/a/b/",
            "https://EXAMPLE.com/#frag",
            "https://example.com",
            "not a url",
        ];
        for input in inputs {
            let once = normalize_url(input);
            assert_eq!(normalize_url(&once), once);
        }
    }

    #[test]
    fn test_lock_key_collapses_www() {
        assert_eq!(
            lock_key("https://www.example.com/a"),
            lock_key("https://example.com/a")
        );
        // The canonical URL itself keeps the www host
        assert_eq!(
            normalize_url("https://www.example.com/a"),
            "https://www.example.com/a"
        );
    }

    #[test]
    fn test_matches_patterns() {
        let includes = vec![Regex::new("^/docs").unwrap()];
        let excludes = vec![Regex::new("/private").unwrap()];

        assert!(matches_patterns("/docs/a", &includes, &excludes));
        assert!(!matches_patterns("/docs/private/x", &includes, &excludes));
        assert!(!matches_patterns("/blog/a", &includes, &excludes));

        // Empty include set accepts everything not excluded
        assert!(matches_patterns("/blog/a", &[], &excludes));
        assert!(!matches_patterns("/private/a", &[], &excludes));
    }

    #[test]
    fn test_is_binary_document() {
        assert!(is_binary_document("https://ex.com/report.pdf"));
        assert!(is_binary_document("https://ex.com/files/cv.DOCX"));
        assert!(!is_binary_document("https://ex.com/pdf-guide"));
    }
}
