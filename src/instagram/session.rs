//! Cookie-authenticated API session.
//!
//! Cookies come from a Netscape-format `cookies.txt` exported from the
//! browser. The platform rotates session ids, so callers re-read the file
//! after rate-limit and cooldown pauses and rebuild the session.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use thiserror::Error;
use tracing::debug;

use crate::constants::{DESKTOP_USER_AGENT, IG_APP_ID, IG_BASE_URL, SHORTCODE_ALPHABET};

/// Cookies the private API refuses to work without.
pub const REQUIRED_COOKIES: [&str; 3] = ["sessionid", "csrftoken", "ds_user_id"];

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("failed to read cookies file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing Instagram cookies: {0:?}. Log into Instagram in the browser and re-export")]
    Missing(Vec<String>),
}

#[derive(Debug, Error)]
#[error("invalid shortcode character {ch:?}")]
pub struct ShortcodeError {
    pub ch: char,
}

/// The cookie set extracted from the browser, name -> value.
#[derive(Debug, Clone)]
pub struct CookieBundle {
    cookies: BTreeMap<String, String>,
}

impl CookieBundle {
    /// Load Instagram cookies from a Netscape-format cookies file.
    ///
    /// This is the single opaque extraction step: everything upstream of the
    /// file (browser, encryption, profiles) is someone else's problem.
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable or any required cookie is absent.
    pub fn load(path: &Path) -> Result<Self, CookieError> {
        let text = std::fs::read_to_string(path).map_err(|e| CookieError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut cookies = BTreeMap::new();
        for line in text.lines() {
            // HttpOnly cookies are serialized with a #HttpOnly_ domain prefix.
            let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                continue;
            }
            if !fields[0].contains("instagram") {
                continue;
            }
            cookies.insert(fields[5].to_string(), fields[6].to_string());
        }

        let missing: Vec<String> = REQUIRED_COOKIES
            .iter()
            .filter(|name| !cookies.contains_key(**name))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(CookieError::Missing(missing));
        }

        debug!(count = cookies.len(), "Loaded Instagram cookies");
        Ok(Self { cookies })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// The logged-in account's numeric user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        self.get("ds_user_id").unwrap_or("?")
    }

    fn csrf_token(&self) -> &str {
        self.get("csrftoken").unwrap_or("")
    }

    fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

}

/// Long-lived authenticated session against the platform's private web API.
///
/// Carries the transport-fallback state: once GraphQL starts answering with
/// HTML checkpoint pages, `graphql_available` flips false and every later
/// fetch goes straight to REST. The flag is per-session; building a fresh
/// session resets it.
#[derive(Debug)]
pub struct ApiSession {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) graphql_available: bool,
    user_id: String,
}

impl ApiSession {
    /// Build a session with the web app's fixed header set and the cookie
    /// bundle installed.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(cookies: &CookieBundle, timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_base_url(cookies, timeout, IG_BASE_URL)
    }

    /// Same as [`new`](Self::new) against an explicit host; used by tests to
    /// point at a mock server.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn with_base_url(
        cookies: &CookieBundle,
        timeout: Duration,
        base_url: &str,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-CSRFToken",
            HeaderValue::from_str(cookies.csrf_token()).unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert("X-IG-App-ID", HeaderValue::from_static(IG_APP_ID));
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert(
            reqwest::header::REFERER,
            HeaderValue::from_static("https://www.instagram.com/"),
        );
        headers.insert(
            reqwest::header::ORIGIN,
            HeaderValue::from_static("https://www.instagram.com"),
        );
        headers.insert(
            reqwest::header::COOKIE,
            HeaderValue::from_str(&cookies.header_value())
                .unwrap_or(HeaderValue::from_static("")),
        );

        let client = reqwest::Client::builder()
            .user_agent(DESKTOP_USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            graphql_available: true,
            user_id: cookies.user_id().to_string(),
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether GraphQL is still in play, or the session has downgraded to
    /// REST after a checkpoint.
    #[must_use]
    pub fn graphql_available(&self) -> bool {
        self.graphql_available
    }
}

/// Convert a shortcode to its numeric media PK.
///
/// Shortcodes are base-64 over Instagram's custom alphabet; decoding is a
/// plain base-64 accumulation.
///
/// # Errors
///
/// Fails on any character outside the alphabet. Callers surface this rather
/// than retry: the shortcode itself is bad.
pub fn shortcode_to_pk(shortcode: &str) -> Result<u128, ShortcodeError> {
    let mut pk: u128 = 0;
    for ch in shortcode.chars() {
        let idx = SHORTCODE_ALPHABET
            .find(ch)
            .ok_or(ShortcodeError { ch })?;
        pk = pk * 64 + idx as u128;
    }
    Ok(pk)
}

/// Inverse of [`shortcode_to_pk`].
#[must_use]
pub fn pk_to_shortcode(pk: u128) -> String {
    if pk == 0 {
        return "A".to_string();
    }
    let alphabet: Vec<char> = SHORTCODE_ALPHABET.chars().collect();
    let mut pk = pk;
    let mut out = Vec::new();
    while pk > 0 {
        out.push(alphabet[(pk % 64) as usize]);
        pk /= 64;
    }
    out.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortcode_to_pk_boundaries() {
        assert_eq!(shortcode_to_pk("A").unwrap(), 0);
        assert_eq!(shortcode_to_pk("B").unwrap(), 1);
        assert_eq!(shortcode_to_pk("_").unwrap(), 63);
        assert_eq!(shortcode_to_pk("BA").unwrap(), 64);
    }

    #[test]
    fn test_shortcode_invalid_character() {
        let err = shortcode_to_pk("AB!").unwrap_err();
        assert_eq!(err.ch, '!');
    }

    #[test]
    fn test_codec_roundtrip() {
        for pk in [0u128, 1, 63, 64, 4095, 3_141_592_653_589] {
            assert_eq!(shortcode_to_pk(&pk_to_shortcode(pk)).unwrap(), pk);
        }
        assert_eq!(pk_to_shortcode(0), "A");
    }

    #[test]
    fn test_cookie_parse_netscape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(
            &path,
            "# Netscape HTTP Cookie File\n\
             .instagram.com\tTRUE\t/\tTRUE\t0\tcsrftoken\tabc\n\
             #HttpOnly_.instagram.com\tTRUE\t/\tTRUE\t0\tsessionid\txyz\n\
             .instagram.com\tTRUE\t/\tTRUE\t0\tds_user_id\t42\n\
             .example.com\tTRUE\t/\tTRUE\t0\tother\tnope\n",
        )
        .unwrap();

        let bundle = CookieBundle::load(&path).unwrap();
        assert_eq!(bundle.get("sessionid"), Some("xyz"));
        assert_eq!(bundle.get("csrftoken"), Some("abc"));
        assert_eq!(bundle.user_id(), "42");
        assert_eq!(bundle.get("other"), None);
    }

    #[test]
    fn test_cookie_missing_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(
            &path,
            ".instagram.com\tTRUE\t/\tTRUE\t0\tcsrftoken\tabc\n",
        )
        .unwrap();

        match CookieBundle::load(&path) {
            Err(CookieError::Missing(names)) => {
                assert!(names.contains(&"sessionid".to_string()));
                assert!(names.contains(&"ds_user_id".to_string()));
            }
            other => panic!("expected missing-cookie error, got {other:?}"),
        }
    }

    #[test]
    fn test_cookie_header_value_joined() {
        let mut cookies = BTreeMap::new();
        cookies.insert("sessionid".to_string(), "test-session".to_string());
        cookies.insert("csrftoken".to_string(), "test-csrf".to_string());
        let bundle = CookieBundle { cookies };

        let header = bundle.header_value();
        assert!(header.contains("sessionid=test-session"));
        assert!(header.contains("; "));
    }
}
