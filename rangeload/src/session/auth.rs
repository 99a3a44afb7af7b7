//! Request authentication headers.
//!
//! Supports Basic, Bearer, and Digest (RFC 7616, MD5 with `qop=auth`,
//! nonce-count and client nonce). NTLM is limited to the Type-1 negotiate
//! message; the challenge-response half of the handshake is not implemented,
//! so NTLM-protected servers are effectively unsupported.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};

/// Credentials attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthCredentials {
    Basic { username: String, password: String },
    Bearer { token: String },
    Digest { username: String, password: String },
    /// Type-1 negotiate only; see module docs.
    Ntlm,
}

/// `Authorization` value for Basic credentials.
pub fn basic_header(username: &str, password: &str) -> String {
    let encoded = BASE64.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

/// `Authorization` value for a Bearer token.
pub fn bearer_header(token: &str) -> String {
    format!("Bearer {token}")
}

/// A parsed `WWW-Authenticate: Digest` challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Whether the server offered `qop=auth`.
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse the challenge parameters out of a `WWW-Authenticate` value.
    ///
    /// Returns `None` unless the scheme is `Digest` with both `realm` and
    /// `nonce` present.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest ")?;
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;

        for param in split_challenge_params(rest) {
            let (key, value) = param.split_once('=')?;
            let value = value.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                "opaque" => opaque = Some(value.to_string()),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
        })
    }
}

/// Split challenge parameters on commas outside quoted strings.
fn split_challenge_params(input: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                params.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(input[start..].trim());
    params.retain(|p| !p.is_empty());
    params
}

/// Stateful Digest responder tracking the nonce count across requests.
#[derive(Debug)]
pub struct DigestSession {
    challenge: DigestChallenge,
    nonce_count: u32,
}

impl DigestSession {
    pub fn new(challenge: DigestChallenge) -> Self {
        Self {
            challenge,
            nonce_count: 0,
        }
    }

    /// Build the `Authorization` value for one request.
    ///
    /// Increments the nonce count; `cnonce` is the caller-supplied client
    /// nonce so responses are reproducible under test.
    pub fn authorization(
        &mut self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> String {
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);

        let ha1 = md5_hex(&format!("{username}:{}:{password}", self.challenge.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));

        let response = if self.challenge.qop_auth {
            md5_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
                self.challenge.nonce
            ))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.challenge.nonce))
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
            self.challenge.realm, self.challenge.nonce
        );
        if self.challenge.qop_auth {
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
        }
        if let Some(opaque) = &self.challenge.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str(", algorithm=MD5");
        header
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// NTLM Type-1 negotiate message.
///
/// Flags: Unicode, OEM, request-target, NTLM, always-sign. Domain and
/// workstation buffers are empty.
pub fn ntlm_negotiate_header() -> String {
    const FLAGS: u32 = 0x0000_8207;
    let mut message = Vec::with_capacity(32);
    message.extend_from_slice(b"NTLMSSP\0");
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&FLAGS.to_le_bytes());
    // Two empty security buffers (domain, workstation) pointing past the
    // fixed header.
    for _ in 0..2 {
        message.extend_from_slice(&0u16.to_le_bytes());
        message.extend_from_slice(&0u16.to_le_bytes());
        message.extend_from_slice(&32u32.to_le_bytes());
    }
    format!("NTLM {}", BASE64.encode(message))
}

impl AuthCredentials {
    /// The `Authorization` value for schemes that need no server challenge.
    ///
    /// Digest returns `None` here: it requires a challenge, handled through
    /// [`DigestSession`].
    pub fn proactive_header(&self) -> Option<String> {
        match self {
            Self::Basic { username, password } => Some(basic_header(username, password)),
            Self::Bearer { token } => Some(bearer_header(token)),
            Self::Ntlm => Some(ntlm_negotiate_header()),
            Self::Digest { .. } => None,
        }
    }
}
