//! URI and header rewriting between the public front end and leased ports

use hyper::header::HeaderName;
use std::borrow::Cow;
use std::fmt::Write;

/// Host used for every outbound request
pub const BACKEND_HOST: &str = "localhost";

/// Headers meaningful only for a single connection hop
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Header names are stored lowercase, so a plain comparison is case-insensitive
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Base URL of a leased port, without a trailing slash
pub fn backend_base(port: u16) -> String {
    format!("http://{}:{}", BACKEND_HOST, port)
}

/// ASCII characters passed through unescaped: alphanumerics plus the
/// unreserved, punctuation and reserved sets, and `%` so existing escapes stay.
fn is_query_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'_' | b'-' | b'!' | b'.' | b'~' | b'\'' | b'(' | b')' | b'*'
                | b',' | b';' | b':' | b'$' | b'&' | b'+' | b'='
                | b'?' | b'/' | b'[' | b']' | b'@'
                | b'%'
        )
}

/// Percent-encode every byte outside the allow-list as uppercase `%XX`
pub fn encode_uri_query(input: &str) -> Cow<'_, str> {
    let Some(first) = input.bytes().position(|b| !is_query_char(b)) else {
        return Cow::Borrowed(input);
    };

    let mut out = String::with_capacity(input.len() + 16);
    out.push_str(&input[..first]);
    for b in input[first..].bytes() {
        if is_query_char(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    Cow::Owned(out)
}

/// Re-encode an inbound `path?query#fragment` for the outbound request.
///
/// The fragment is dropped unless `forward_fragment` is set.
pub fn rewrite_path_and_query(raw: &str, forward_fragment: bool) -> String {
    let (before_fragment, fragment) = match raw.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (raw, None),
    };
    let (path, query) = match before_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (before_fragment, None),
    };

    let mut out = String::with_capacity(raw.len() + 16);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(&encode_uri_query(path));

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(&encode_uri_query(query));
    }
    if let Some(fragment) = fragment.filter(|_| forward_fragment) {
        out.push('#');
        out.push_str(&encode_uri_query(fragment));
    }
    out
}

/// Full outbound URL for a request against a leased port
pub fn rewrite_url_from_request(port: u16, raw_path_and_query: &str, forward_fragment: bool) -> String {
    format!(
        "{}{}",
        backend_base(port),
        rewrite_path_and_query(raw_path_and_query, forward_fragment)
    )
}

/// Map a backend redirect target back onto the front end.
///
/// A `location` under `backend_base` (e.g. `http://localhost:20001/new`) is
/// rebased onto `frontend_base` (e.g. `http://t-api.local`). Anything else is
/// returned unchanged.
pub fn rewrite_url_from_response(location: &str, backend_base: &str, frontend_base: &str) -> String {
    match location.strip_prefix(backend_base) {
        Some("") => format!("{}/", frontend_base),
        Some(rest) if rest.starts_with(['/', '?', '#']) => format!("{}{}", frontend_base, rest),
        _ => location.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_leaves_allowed_chars() {
        let input = "name=value&foo=bar/baz?x=[1]@host:8080;a,b$c+d!e~f'g(h)i*j";
        assert!(matches!(encode_uri_query(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_encode_keeps_existing_escapes() {
        assert_eq!(encode_uri_query("a%20b%2Fc"), "a%20b%2Fc");
    }

    #[test]
    fn test_encode_escapes_everything_else() {
        assert_eq!(encode_uri_query("a b"), "a%20b");
        assert_eq!(encode_uri_query("x\"y<z>{}|\\^`"), "x%22y%3Cz%3E%7B%7D%7C%5C%5E%60");
        assert_eq!(encode_uri_query("#"), "%23");
        assert_eq!(encode_uri_query("é"), "%C3%A9");
    }

    #[test]
    fn test_rewrite_drops_fragment_by_default() {
        assert_eq!(
            rewrite_path_and_query("/a b?x=1&y=2#frag", false),
            "/a%20b?x=1&y=2"
        );
    }

    #[test]
    fn test_rewrite_forwards_fragment_when_enabled() {
        assert_eq!(
            rewrite_path_and_query("/a b?x=1&y=2#frag ment", true),
            "/a%20b?x=1&y=2#frag%20ment"
        );
        assert_eq!(rewrite_path_and_query("/page#top", true), "/page#top");
    }

    #[test]
    fn test_rewrite_path_edge_cases() {
        assert_eq!(rewrite_path_and_query("", false), "/");
        assert_eq!(rewrite_path_and_query("/", false), "/");
        assert_eq!(rewrite_path_and_query("/search?", false), "/search");
        assert_eq!(rewrite_path_and_query("/a?b?c", false), "/a?b?c");
    }

    #[test]
    fn test_rewrite_url_from_request() {
        assert_eq!(
            rewrite_url_from_request(20001, "/old?q=1", false),
            "http://localhost:20001/old?q=1"
        );
    }

    #[test]
    fn test_rewrite_url_from_response() {
        let backend = backend_base(20001);

        assert_eq!(
            rewrite_url_from_response("http://localhost:20001/new", &backend, "http://frontend"),
            "http://frontend/new"
        );
        assert_eq!(
            rewrite_url_from_response("http://localhost:20001", &backend, "http://frontend"),
            "http://frontend/"
        );
        assert_eq!(
            rewrite_url_from_response("http://localhost:20001?a=1", &backend, "http://frontend"),
            "http://frontend?a=1"
        );
    }

    #[test]
    fn test_rewrite_url_from_response_leaves_foreign_locations() {
        let backend = backend_base(20001);

        assert_eq!(
            rewrite_url_from_response("https://example.com/login", &backend, "http://frontend"),
            "https://example.com/login"
        );
        assert_eq!(
            rewrite_url_from_response("http://localhost:200012/x", &backend, "http://frontend"),
            "http://localhost:200012/x"
        );
        assert_eq!(
            rewrite_url_from_response("/relative", &backend, "http://frontend"),
            "/relative"
        );
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(is_hop_by_hop(&HeaderName::from_bytes(b"Keep-Alive").unwrap()));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("host")));
    }
}
