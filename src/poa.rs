//! Seam to the external PAPI point-of-access library.
//!
//! The library owns the protocol: it knows whether a PAPI session exists,
//! builds the redirect to the PAPI authentication server, and hands back
//! user attributes. This module only describes what the bridge needs from
//! it and the pre-redirect hook the bridge registers.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::PapiError;
use crate::helpers::append_query_fragment;

/// Home-locator hint parameter.
pub const PAPI_HLI: &str = "PAPIHLI";
/// Service-provider hint parameter.
pub const PAPI_OPOA: &str = "PAPIOPOA";
/// Return URL the PAPI server sends the browser back to.
pub const PAPI_URL: &str = "URL";
/// Query parameter carrying the state handle back to this source.
pub const STATE_ID_PARAM: &str = "SSPStateID";

/// Points in the library's flow where a [`RedirectHook`] can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Login redirect parameters are final.
    RedirectUrlFinish,
    /// Single-logout redirect parameters are final.
    SloRedirectUrlFinish,
}

impl HookEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RedirectUrlFinish => "PAPI_REDIRECT_URL_FINISH",
            Self::SloRedirectUrlFinish => "PAPI_SLO_REDIRECT_URL_FINISH",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-shot callback run synchronously just before the library issues
/// its redirect. Returning `true` cancels the default redirect.
pub type RedirectHook = Box<dyn FnOnce(&mut RedirectParams) -> bool + Send>;

/// Outbound parameters of a PAPI redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectParams {
    values: BTreeMap<String, String>,
}

impl RedirectParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters with only the return `URL` set.
    pub fn with_url(url: impl Into<String>) -> Self {
        let mut params = Self::new();
        params.insert(PAPI_URL, url);
        params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn url(&self) -> Option<&str> {
        self.get(PAPI_URL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Location of the redirect to `endpoint` carrying these parameters.
    pub fn to_location(&self, endpoint: &str) -> Result<String, PapiError> {
        let mut location = Url::parse(endpoint)?;
        {
            let mut query = location.query_pairs_mut();
            for (key, value) in self.iter() {
                query.append_pair(key, value);
            }
        }
        Ok(location.to_string())
    }
}

/// What the bridge injects into the outbound redirect (the
/// `RedirectParameterSet`). Built once per transaction and consumed by
/// [`RedirectHints::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectHints {
    pub hli: Option<String>,
    pub papiopoa: Option<String>,
    pub state_id: String,
}

impl RedirectHints {
    /// Sets `PAPIHLI` and `PAPIOPOA` when known and appends the
    /// URL-encoded `SSPStateID=<handle>` fragment to `URL`.
    ///
    /// Always returns `false`: the default redirect goes ahead.
    pub fn apply(self, params: &mut RedirectParams) -> bool {
        if let Some(hli) = self.hli.filter(|v| !v.is_empty()) {
            params.insert(PAPI_HLI, hli);
        }
        if let Some(papiopoa) = self.papiopoa.filter(|v| !v.is_empty()) {
            params.insert(PAPI_OPOA, papiopoa);
        }

        let pair = format!("{STATE_ID_PARAM}={}", self.state_id);
        let fragment = urlencoding::encode(&pair);
        let url = append_query_fragment(params.url().unwrap_or_default(), &fragment);
        params.insert(PAPI_URL, url);
        false
    }

    pub fn into_hook(self) -> RedirectHook {
        Box::new(move |params: &mut RedirectParams| self.apply(params))
    }
}

/// Result of a library call that may send the browser away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoaOutcome {
    /// The library wants the browser at `location`; the current
    /// transaction ends here.
    Redirect { location: String },
    /// The call returned normally (a PAPI session already exists).
    Continue,
}

/// The external PAPI point-of-access library, bound to one site.
pub trait PointOfAccess {
    fn is_authenticated(&self) -> Result<bool, PapiError>;

    /// Registers a hook for the next time `event` fires.
    fn add_hook(&mut self, event: HookEvent, hook: RedirectHook);

    fn authenticate(&mut self) -> Result<PoaOutcome, PapiError>;

    /// `slo` asks for single logout at the PAPI server as well.
    fn logout(&mut self, slo: bool) -> Result<PoaOutcome, PapiError>;

    /// Raw attributes of the current PAPI session, values being scalars or
    /// arrays. `None` when the library has none.
    fn attributes(&self) -> Result<Option<Map<String, Value>>, PapiError>;
}

/// Hook bookkeeping for [`PointOfAccess`] implementations.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<(HookEvent, RedirectHook)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: HookEvent, hook: RedirectHook) {
        self.hooks.push((event, hook));
    }

    pub fn pending(&self, event: HookEvent) -> usize {
        self.hooks.iter().filter(|(e, _)| *e == event).count()
    }

    /// Runs and drops every hook registered for `event`, in registration
    /// order. Returns `true` if any of them cancelled the redirect.
    pub fn fire(&mut self, event: HookEvent, params: &mut RedirectParams) -> bool {
        let mut cancelled = false;
        let mut remaining = Vec::with_capacity(self.hooks.len());
        for (registered, hook) in self.hooks.drain(..) {
            if registered == event {
                cancelled |= hook(&mut *params);
            } else {
                remaining.push((registered, hook));
            }
        }
        self.hooks = remaining;
        cancelled
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(event, _)| event))
            .finish()
    }
}

/// Converts raw PAPI attributes to the host shape where every value is an
/// array. Scalars become one-element arrays; `null` values are dropped.
pub fn normalize_attributes(raw: Map<String, Value>) -> Map<String, Value> {
    raw.into_iter()
        .filter_map(|(name, value)| match value {
            Value::Null => None,
            Value::Array(_) => Some((name, value)),
            scalar => Some((name, Value::Array(vec![scalar]))),
        })
        .collect()
}
