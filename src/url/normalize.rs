use crate::UrlError;
use url::Url;

/// Produces the canonical form of a URL used as the registry key
///
/// # Normalization Steps
///
/// 1. Reject anything that is not HTTP or HTTPS, or has no host
/// 2. Remove the fragment (everything after #)
///
/// In aggressive mode additionally:
///
/// 3. Collapse repeated slashes in the path
/// 4. Remove a trailing slash (except for the root /)
/// 5. Sort query parameters and drop an empty query string
///
/// Host lowercasing and dot-segment removal are already done by the `url` parser.
///
/// # Examples
///
/// ```
/// use site_mirror::url::normalize_url;
/// use url::Url;
///
/// let url = Url::parse("http://Example.com//a//b/?z=1&a=2#top").unwrap();
/// assert_eq!(normalize_url(&url, false).unwrap().as_str(), "http://example.com//a//b/?z=1&a=2");
/// assert_eq!(normalize_url(&url, true).unwrap().as_str(), "http://example.com/a/b?a=2&z=1");
/// ```
pub fn normalize_url(url: &Url, aggressive: bool) -> Result<Url, UrlError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    let mut url = url.clone();
    url.set_fragment(None);

    if aggressive {
        let path = sanitize_path(url.path());
        url.set_path(&path);

        if url.query().is_some() {
            let mut params: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            params.sort();

            if params.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(params);
            }
        }
    }

    Ok(url)
}

/// Parses and normalizes a URL string in one go
pub fn parse_normalized(url_str: &str, aggressive: bool) -> Result<Url, UrlError> {
    let url = Url::parse(url_str).map_err(|e| UrlError::Parse(e.to_string()))?;
    normalize_url(&url, aggressive)
}

/// Collapses repeated slashes and drops the trailing slash
fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str, aggressive: bool) -> String {
        parse_normalized(s, aggressive).unwrap().to_string()
    }

    #[test]
    fn test_remove_fragment() {
        assert_eq!(norm("https://example.com/page#section", false), "https://example.com/page");
    }

    #[test]
    fn test_gentle_mode_keeps_path_and_query() {
        assert_eq!(
            norm("https://example.com//a/?b=2&a=1", false),
            "https://example.com//a/?b=2&a=1"
        );
    }

    #[test]
    fn test_aggressive_sorts_query() {
        assert_eq!(
            norm("https://example.com/page?b=2&a=1", true),
            "https://example.com/page?a=1&b=2"
        );
    }

    #[test]
    fn test_aggressive_collapses_slashes() {
        assert_eq!(
            norm("https://example.com///path//to///page/", true),
            "https://example.com/path/to/page"
        );
    }

    #[test]
    fn test_aggressive_keeps_root() {
        assert_eq!(norm("https://example.com", true), "https://example.com/");
    }

    #[test]
    fn test_aggressive_drops_empty_query() {
        assert_eq!(norm("https://example.com/a?", true), "https://example.com/a");
    }

    #[test]
    fn test_dot_segments_resolved_by_parser() {
        assert_eq!(norm("https://example.com/a/../b/./c", false), "https://example.com/b/c");
    }

    #[test]
    fn test_lowercase_host() {
        assert_eq!(norm("https://EXAMPLE.COM/Page", false), "https://example.com/Page");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = parse_normalized("ftp://example.com/page", false);
        assert!(matches!(result.unwrap_err(), UrlError::InvalidScheme(_)));
    }

    #[test]
    fn test_malformed_url() {
        assert!(matches!(
            parse_normalized("not a url", false).unwrap_err(),
            UrlError::Parse(_)
        ));
    }
}
