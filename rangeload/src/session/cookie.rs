//! Cookie storage with scope-aware lookup.
//!
//! The jar stores cookies captured from `Set-Cookie` response headers and
//! returns the subset applicable to a request URL:
//!
//! - Domain: exact host match, or suffix match for a leading-dot domain
//! - Path: the URL path must have the cookie path as a prefix
//! - `Secure` cookies are only sent over HTTPS
//! - Expired cookies (past `Expires`, or `Max-Age` consumed) are dropped at
//!   read time

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One stored cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Host scope; a leading dot means "this domain and subdomains".
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Absolute expiry, from `Expires` or `Max-Age`. `None` means session
    /// lifetime.
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    /// Parse a `Set-Cookie` header value in the context of the request URL.
    ///
    /// Returns `None` for values without a `name=value` pair. Unknown
    /// attributes are ignored. `Max-Age` wins over `Expires` when both are
    /// present.
    pub fn parse(header: &str, request_url: &Url) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: request_url.host_str().unwrap_or_default().to_string(),
            path: default_path(request_url),
            secure: false,
            http_only: false,
            expires: None,
        };

        let mut max_age: Option<i64> = None;
        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attr, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    if let Some(domain) = val {
                        let domain = domain.trim_start_matches('.');
                        if !domain.is_empty() {
                            // Attribute-set domains cover subdomains.
                            cookie.domain = format!(".{domain}");
                        }
                    }
                }
                "path" => {
                    if let Some(path) = val.filter(|p| p.starts_with('/')) {
                        cookie.path = path.to_string();
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "max-age" => max_age = val.and_then(|v| v.parse().ok()),
                "expires" => {
                    if let Some(text) = val {
                        if let Ok(when) = DateTime::parse_from_rfc2822(text) {
                            cookie.expires = Some(when.with_timezone(&Utc));
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(seconds) = max_age {
            cookie.expires = Some(Utc::now() + Duration::seconds(seconds));
        }

        Some(cookie)
    }

    /// Whether this cookie has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|when| when <= now)
    }

    /// Whether this cookie applies to the given URL.
    pub fn matches(&self, url: &Url) -> bool {
        let host = match url.host_str() {
            Some(host) => host,
            None => return false,
        };
        let domain_ok = if let Some(suffix) = self.domain.strip_prefix('.') {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == self.domain
        };
        if !domain_ok {
            return false;
        }
        if !url.path().starts_with(&self.path) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        true
    }
}

/// Default cookie path per RFC 6265: the request path up to its last slash.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// A session's cookie collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a cookie. Identity is `(name, domain, path)`.
    pub fn store(&mut self, cookie: Cookie) {
        self.cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        self.cookies.push(cookie);
    }

    /// Capture every `Set-Cookie` value from a response.
    pub fn store_from_response(&mut self, set_cookie_values: &[String], request_url: &Url) {
        for value in set_cookie_values {
            if let Some(cookie) = Cookie::parse(value, request_url) {
                self.store(cookie);
            }
        }
    }

    /// Cookies applicable to `url`, dropping expired entries as a side
    /// effect.
    pub fn matching(&mut self, url: &Url) -> Vec<&Cookie> {
        let now = Utc::now();
        self.cookies.retain(|c| !c.is_expired(now));
        self.cookies.iter().filter(|c| c.matches(url)).collect()
    }

    /// Render the `Cookie` request header for `url`, if any cookie applies.
    pub fn header_for(&mut self, url: &Url) -> Option<String> {
        let pairs: Vec<String> = self
            .matching(url)
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Number of stored cookies, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Iterate all stored cookies.
    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let cookie = Cookie::parse("sid=abc123", &url("http://example.com/files/a")).unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.domain, "example.com");
        assert_eq!(cookie.path, "/files");
        assert!(!cookie.secure);
        assert!(cookie.expires.is_none());
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = Cookie::parse(
            "token=xyz; Domain=example.com; Path=/dl; Secure; HttpOnly",
            &url("https://sub.example.com/"),
        )
        .unwrap();
        assert_eq!(cookie.domain, ".example.com");
        assert_eq!(cookie.path, "/dl");
        assert!(cookie.secure);
        assert!(cookie.http_only);
    }

    #[test]
    fn test_parse_rejects_nameless() {
        assert!(Cookie::parse("no-equals-sign", &url("http://x.com/")).is_none());
        assert!(Cookie::parse("=value", &url("http://x.com/")).is_none());
    }

    #[test]
    fn test_max_age_wins_over_expires() {
        let cookie = Cookie::parse(
            "a=1; Expires=Wed, 01 Jan 2020 00:00:00 GMT; Max-Age=3600",
            &url("http://x.com/"),
        )
        .unwrap();
        // Max-Age puts expiry an hour out, not in 2020.
        assert!(!cookie.is_expired(Utc::now()));
    }

    #[test]
    fn test_expires_parsing() {
        let cookie = Cookie::parse(
            "a=1; Expires=Wed, 01 Jan 2020 00:00:00 GMT",
            &url("http://x.com/"),
        )
        .unwrap();
        assert!(cookie.is_expired(Utc::now()));
    }

    #[test]
    fn test_domain_exact_match() {
        let cookie = Cookie::parse("a=1", &url("http://example.com/")).unwrap();
        assert!(cookie.matches(&url("http://example.com/anything")));
        assert!(!cookie.matches(&url("http://sub.example.com/")));
    }

    #[test]
    fn test_domain_suffix_match() {
        let cookie = Cookie::parse("a=1; Domain=example.com", &url("http://example.com/")).unwrap();
        assert!(cookie.matches(&url("http://example.com/")));
        assert!(cookie.matches(&url("http://deep.sub.example.com/")));
        assert!(!cookie.matches(&url("http://notexample.com/")));
    }

    #[test]
    fn test_path_prefix_match() {
        let cookie = Cookie::parse("a=1; Path=/files", &url("http://x.com/")).unwrap();
        assert!(cookie.matches(&url("http://x.com/files/data.bin")));
        assert!(cookie.matches(&url("http://x.com/files")));
        assert!(!cookie.matches(&url("http://x.com/other")));
    }

    #[test]
    fn test_secure_requires_https() {
        let cookie = Cookie::parse("a=1; Secure", &url("https://x.com/")).unwrap();
        assert!(cookie.matches(&url("https://x.com/")));
        assert!(!cookie.matches(&url("http://x.com/")));
    }

    #[test]
    fn test_jar_replaces_same_identity() {
        let mut jar = CookieJar::new();
        let u = url("http://x.com/");
        jar.store(Cookie::parse("a=1", &u).unwrap());
        jar.store(Cookie::parse("a=2", &u).unwrap());
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.header_for(&u).unwrap(), "a=2");
    }

    #[test]
    fn test_jar_drops_expired_on_read() {
        let mut jar = CookieJar::new();
        let u = url("http://x.com/");
        jar.store(Cookie::parse("live=1", &u).unwrap());
        jar.store(
            Cookie::parse("dead=1; Expires=Wed, 01 Jan 2020 00:00:00 GMT", &u).unwrap(),
        );
        assert_eq!(jar.len(), 2);

        let header = jar.header_for(&u).unwrap();
        assert_eq!(header, "live=1");
        assert_eq!(jar.len(), 1, "expired cookie removed by the read");
    }

    #[test]
    fn test_jar_header_joins_with_semicolon() {
        let mut jar = CookieJar::new();
        let u = url("http://x.com/");
        jar.store(Cookie::parse("a=1", &u).unwrap());
        jar.store(Cookie::parse("b=2", &u).unwrap());
        let header = jar.header_for(&u).unwrap();
        assert!(header == "a=1; b=2" || header == "b=2; a=1");
    }

    #[test]
    fn test_store_from_response() {
        let mut jar = CookieJar::new();
        let u = url("http://x.com/login");
        jar.store_from_response(
            &[
                "sid=s1; Path=/".to_string(),
                "theme=dark; Path=/".to_string(),
                "garbage".to_string(),
            ],
            &u,
        );
        assert_eq!(jar.len(), 2);
    }

    #[test]
    fn test_no_header_when_nothing_matches() {
        let mut jar = CookieJar::new();
        jar.store(Cookie::parse("a=1", &url("http://a.com/")).unwrap());
        assert!(jar.header_for(&url("http://b.com/")).is_none());
    }
}
