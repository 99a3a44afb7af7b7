//! HTTP session layer.
//!
//! A session is a reusable cookie-and-header context identified by a session
//! id. The manager builds outgoing request headers (user agent, cookies
//! scoped to the target URL, auth, referer, caller overrides), performs
//! probe and `pre_request` calls with manual redirect tracking, and absorbs
//! `Set-Cookie` headers from every response it sees.
//!
//! Redirects are followed by hand rather than by the HTTP client so the
//! chain can be reported and each hop's cookies captured. A `303 See Other`
//! downgrades the method to GET; the chain is capped at `max_redirects`.

mod auth;
mod cookie;

pub use auth::{
    basic_header, bearer_header, ntlm_negotiate_header, AuthCredentials, DigestChallenge,
    DigestSession,
};
pub use cookie::{Cookie, CookieJar};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE, WWW_AUTHENTICATE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{DownloadError, DownloadResult};
use crate::task::ServerMetadata;

/// Default User-Agent sent when a session does not override it.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Default redirect-chain cap.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Per-session mutable state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: CookieJar,
    /// Headers applied to every request of this session (lowercase keys).
    pub header_overrides: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub auth: Option<AuthCredentials>,
}

/// Options for [`SessionManager::pre_request`].
#[derive(Debug, Clone)]
pub struct PreRequestOptions {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_ms: u64,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub session_id: Option<String>,
}

impl PreRequestOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: 30_000,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: None,
            referer: None,
            session_id: None,
        }
    }
}

/// Result of a `pre_request` call.
#[derive(Debug, Clone, Serialize)]
pub struct PreRequestOutcome {
    pub session_id: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<Cookie>,
    pub redirect_chain: Vec<String>,
    pub final_url: String,
    pub elapsed_ms: u64,
}

/// Process-wide session registry and request front-end.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionState>>,
    client: reqwest::Client,
}

impl SessionManager {
    /// Create a manager with its redirect-disabled HTTP client.
    pub fn new() -> DownloadResult<Arc<Self>> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            client,
        }))
    }

    /// Create (or replace) a session, returning its id.
    pub async fn create(&self, session_id: Option<String>, state: Option<SessionState>) -> String {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.sessions
            .lock()
            .await
            .insert(id.clone(), state.unwrap_or_default());
        id
    }

    /// Whether a session exists.
    pub async fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Build the merged request headers for `url`.
    ///
    /// Precedence, lowest first: session defaults (user agent, referer,
    /// auth), cookies scoped to the URL, session header overrides, caller
    /// extras. Caller overrides always win. An unknown session id behaves as
    /// an empty session.
    pub async fn build_headers(
        &self,
        session_id: Option<&str>,
        url: &Url,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut sessions = self.sessions.lock().await;
        let state = session_id.and_then(|id| sessions.get_mut(id));

        let mut headers = BTreeMap::new();
        headers.insert(
            "user-agent".to_string(),
            state
                .as_ref()
                .and_then(|s| s.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        );
        // Ranged fetches need byte-exact lengths, so no transfer encodings.
        headers.insert("accept-encoding".to_string(), "identity".to_string());

        if let Some(state) = state {
            if let Some(referer) = &state.referer {
                headers.insert("referer".to_string(), referer.clone());
            }
            if let Some(origin) = &state.origin {
                headers.insert("origin".to_string(), origin.clone());
            }
            if let Some(auth) = state.auth.as_ref().and_then(|a| a.proactive_header()) {
                headers.insert("authorization".to_string(), auth);
            }
            if let Some(cookie_header) = state.cookies.header_for(url) {
                headers.insert("cookie".to_string(), cookie_header);
            }
            for (key, value) in &state.header_overrides {
                headers.insert(key.to_ascii_lowercase(), value.clone());
            }
        }

        for (key, value) in extra {
            headers.insert(key.to_ascii_lowercase(), value.clone());
        }
        headers
    }

    /// Perform a request with redirect tracking and cookie capture.
    ///
    /// Creates the session on the fly when the given id is unknown or
    /// absent, so the returned `session_id` is always usable for follow-up
    /// requests.
    ///
    /// A `401` response against a session holding Digest credentials is
    /// answered once: the `WWW-Authenticate` challenge is parsed and the
    /// request retried with a computed `Authorization` header. A second
    /// `401` is returned to the caller as-is.
    pub async fn pre_request(&self, options: PreRequestOptions) -> DownloadResult<PreRequestOutcome> {
        let method = parse_method(&options.method)?;
        let url = parse_url(&options.url)?;

        let session_id = match &options.session_id {
            Some(id) if self.exists(id).await => id.clone(),
            Some(id) => {
                self.create(Some(id.clone()), None).await;
                id.clone()
            }
            None => self.create(None, None).await,
        };

        if options.user_agent.is_some() || options.referer.is_some() {
            let mut sessions = self.sessions.lock().await;
            if let Some(state) = sessions.get_mut(&session_id) {
                if let Some(agent) = &options.user_agent {
                    state.user_agent = Some(agent.clone());
                }
                if let Some(referer) = &options.referer {
                    state.referer = Some(referer.clone());
                }
            }
        }

        let started = Instant::now();
        let mut current_url = url;
        let mut current_method = method;
        let mut body = options.body.clone();
        let mut redirect_chain = Vec::new();
        let mut digest_authorization: Option<String> = None;

        let response = loop {
            let mut headers = self
                .build_headers(Some(session_id.as_str()), &current_url, &options.headers)
                .await;
            if let Some(authorization) = &digest_authorization {
                headers.insert("authorization".to_string(), authorization.clone());
            }
            let mut request = self
                .client
                .request(current_method.clone(), current_url.clone())
                .headers(to_header_map(&headers))
                .timeout(Duration::from_millis(options.timeout_ms));
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let response = request.send().await.map_err(|e| {
                DownloadError::from_http(current_url.as_str(), options.timeout_ms, e)
            })?;

            self.absorb_cookies(&session_id, &current_url, response.headers())
                .await;

            let status = response.status().as_u16();
            if status == 401 && digest_authorization.is_none() {
                if let Some(answer) = self
                    .digest_answer(
                        &session_id,
                        &current_url,
                        current_method.as_str(),
                        response.headers(),
                    )
                    .await
                {
                    debug!(url = %current_url, "retrying with digest credentials");
                    digest_authorization = Some(answer);
                    continue;
                }
            }
            if !options.follow_redirects || !is_redirect(status) {
                break response;
            }
            if redirect_chain.len() >= options.max_redirects {
                return Err(DownloadError::TooManyRedirects {
                    url: options.url.clone(),
                    limit: options.max_redirects,
                });
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| DownloadError::InvalidRedirect {
                    url: current_url.to_string(),
                    detail: "missing Location header".to_string(),
                })?;
            let next_url =
                current_url
                    .join(location)
                    .map_err(|e| DownloadError::InvalidRedirect {
                        url: current_url.to_string(),
                        detail: format!("unparseable Location {location:?}: {e}"),
                    })?;

            debug!(from = %current_url, to = %next_url, status, "following redirect");
            if status == 303 {
                current_method = Method::GET;
                body = None;
            }
            // A digest response is bound to the URI it was computed for.
            digest_authorization = None;
            redirect_chain.push(next_url.to_string());
            current_url = next_url;
        };

        let status = response.status().as_u16();
        let final_url = current_url.to_string();
        let headers = flatten_headers(response.headers());

        // The final URL becomes the referer for subsequent session requests.
        let cookies = {
            let mut sessions = self.sessions.lock().await;
            let state = sessions.entry(session_id.clone()).or_default();
            state.referer = Some(final_url.clone());
            state.cookies.iter().cloned().collect()
        };

        Ok(PreRequestOutcome {
            session_id,
            status,
            headers,
            cookies,
            redirect_chain,
            final_url,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// HEAD-probe a resource, capturing the server metadata downloads plan
    /// against. Follows redirects up to the default cap.
    pub async fn probe(
        &self,
        url: &str,
        session_id: Option<&str>,
        extra_headers: &BTreeMap<String, String>,
        timeout_ms: u64,
    ) -> DownloadResult<(ServerMetadata, String)> {
        let mut options = PreRequestOptions::new(url);
        options.method = "HEAD".to_string();
        options.headers = extra_headers.clone();
        options.timeout_ms = timeout_ms;
        options.session_id = session_id.map(String::from);

        let outcome = self.pre_request(options).await?;
        if outcome.status >= 400 {
            return Err(DownloadError::from_status(url, outcome.status));
        }

        let metadata = ServerMetadata {
            content_length: outcome
                .headers
                .get("content-length")
                .and_then(|v| v.parse().ok()),
            content_type: outcome.headers.get("content-type").cloned(),
            accept_ranges: outcome
                .headers
                .get("accept-ranges")
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            last_modified: outcome.headers.get("last-modified").cloned(),
            etag: outcome.headers.get("etag").cloned(),
        };
        Ok((metadata, outcome.final_url))
    }

    /// Build the `Authorization` answer to a Digest challenge, if the
    /// session holds Digest credentials and the response carries a parseable
    /// `WWW-Authenticate: Digest` header.
    async fn digest_answer(
        &self,
        session_id: &str,
        url: &Url,
        method: &str,
        response_headers: &HeaderMap,
    ) -> Option<String> {
        let challenge = response_headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(DigestChallenge::parse)?;

        let (username, password) = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id).and_then(|s| s.auth.as_ref()) {
                Some(AuthCredentials::Digest { username, password }) => {
                    (username.clone(), password.clone())
                }
                _ => return None,
            }
        };

        let uri = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let cnonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let mut digest = DigestSession::new(challenge);
        Some(digest.authorization(method, &uri, &username, &password, &cnonce))
    }

    async fn absorb_cookies(&self, session_id: &str, url: &Url, headers: &HeaderMap) {
        let values: Vec<String> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(String::from))
            .collect();
        if values.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.cookies.store_from_response(&values, url);
        }
    }
}

fn parse_method(name: &str) -> DownloadResult<Method> {
    match name.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "HEAD" => Ok(Method::HEAD),
        other => Err(DownloadError::InvalidConfig {
            detail: format!("unsupported method: {other}"),
        }),
    }
}

fn parse_url(raw: &str) -> DownloadResult<Url> {
    let url = Url::parse(raw).map_err(|_| DownloadError::InvalidConfig {
        detail: format!("url is not absolute: {raw}"),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DownloadError::InvalidConfig {
            detail: format!("unsupported url scheme: {}", url.scheme()),
        });
    }
    Ok(url)
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!(header = %key, "skipping invalid header name");
                continue;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                map.insert(name, value);
            }
            Err(_) => warn!(header = %key, "skipping invalid header value"),
        }
    }
    map
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}
