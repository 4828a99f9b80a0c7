use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;
use url::form_urlencoded;

pub(crate) const RELAY_STATE_MARKER: &str = "&RelayState=";

static RELAY_TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Query parameters of the inbound HTTP request.
///
/// The host hands these to [`crate::AuthSource::authenticate`] and
/// [`crate::AuthSource::logout`] explicitly; nothing in this crate reads
/// ambient request state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    values: HashMap<String, String>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw query string, with or without the leading `?`.
    ///
    /// A key that decodes to `name=value` with no value of its own is split,
    /// so the URL-encoded `SSPStateID%3D<handle>` fragment appended by
    /// [`crate::RedirectHints::apply`] reads back as `SSPStateID`.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Parses the query of an absolute URL or of a request path such as
    /// `/module.php/papi/resume?SSPStateID=...`.
    pub fn from_url(url_or_path: &str) -> Self {
        parse_url_or_path(url_or_path)
            .and_then(|url| url.query().map(Self::from_query))
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = split_encoded_pair(key.into(), value.into());
        self.values.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for RequestParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

fn split_encoded_pair(key: String, value: String) -> (String, String) {
    if value.is_empty()
        && let Some((name, inner)) = key.split_once('=')
        && !name.is_empty()
    {
        return (name.to_string(), inner.to_string());
    }
    (key, value)
}

fn parse_url_or_path(url_or_path: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(url_or_path) {
        return Some(url);
    }

    let normalized = if url_or_path.starts_with('/') {
        format!("http://localhost{url_or_path}")
    } else {
        format!("http://localhost/{url_or_path}")
    };

    Url::parse(&normalized).ok()
}

/// Returns the value of the last `&RelayState=` assignment in `raw`, up to
/// the next `&`, URL-decoded. `None` when there is no such assignment or
/// its value is empty.
pub(crate) fn extract_relay_state(raw: &str) -> Option<String> {
    let start = raw.rfind(RELAY_STATE_MARKER)? + RELAY_STATE_MARKER.len();
    let value = raw[start..].split('&').next().unwrap_or_default();
    if value.is_empty() {
        return None;
    }

    let spaced = value.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => Some(spaced),
    }
}

/// Token for synthesized relay states. Distinct on every call within the
/// process; the random tail keeps instances sharing a clock apart.
pub(crate) fn unique_token() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let seq = RELAY_TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{micros:x}{seq:04x}{}", random_token(4))
}

/// Appends an already-encoded query fragment to `url`.
pub(crate) fn append_query_fragment(url: &str, fragment: &str) -> String {
    let separator = match url.find('?') {
        None => "?",
        Some(_) if url.ends_with('?') || url.ends_with('&') => "",
        Some(_) => "&",
    };
    format!("{url}{separator}{fragment}")
}

pub(crate) fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
