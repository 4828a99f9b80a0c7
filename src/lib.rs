//! PAPI authentication source: carries the caller's [`AuthState`] across the
//! PAPI redirect and translates the returned attributes.

mod error;
mod helpers;
pub mod poa;
pub mod state;

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use crate::error::PapiError;
pub use crate::helpers::RequestParams;
pub use crate::poa::{
    HookEvent, HookRegistry, PoaOutcome, PointOfAccess, RedirectHints, RedirectHook,
    RedirectParams, STATE_ID_PARAM, normalize_attributes,
};
pub use crate::state::{AuthState, InMemoryStateStore, STAGE_INIT, StateStore, keys};

use crate::helpers::{RELAY_STATE_MARKER, extract_relay_state, unique_token};

/// Query parameter a caller uses to resume its own flow through this source.
pub const CALLER_STATE_PARAM: &str = "providerId";

/// Entry of one PAPI source in the host configuration, e.g.
/// `{"site": "papi-site-key", "hli": "https://wayf.example.org/"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    /// PAPI site key handed to the point of access.
    #[serde(default)]
    pub site: String,
    /// Home locator the PAPI server should use for discovery.
    #[serde(default)]
    pub hli: Option<String>,
}

impl SourceConfig {
    /// Config for `site` with no home locator.
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            hli: None,
        }
    }

    /// Sets the home locator sent as `PAPIHLI`.
    pub fn with_hli(mut self, hli: impl Into<String>) -> Self {
        self.hli = Some(hli.into());
        self
    }

    /// Reads the source's entry from the host configuration. The entry must
    /// be an object; unknown keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self, PapiError> {
        if !value.is_object() {
            return Err(PapiError::InvalidConfig(
                "PAPI authentication source configuration must be an object".to_string(),
            ));
        }
        Self::deserialize(value)?.normalize()
    }

    /// Requires a non-blank `site` and turns a blank `hli` into `None`.
    pub fn normalize(mut self) -> Result<Self, PapiError> {
        if self.site.trim().is_empty() {
            return Err(PapiError::InvalidConfig(
                "PAPI authentication source is not properly configured: missing [site]"
                    .to_string(),
            ));
        }
        if self.hli.as_deref().is_some_and(|hli| hli.trim().is_empty()) {
            self.hli = None;
        }

        Ok(self)
    }
}

/// What the host does next after [`AuthSource::authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Send the browser to `location`. The state is parked in the store.
    Redirect { location: String },
    /// Authentication is complete; hand the state back to the caller.
    Completed(AuthState),
}

impl AuthOutcome {
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::Redirect { location } => Some(location),
            Self::Completed(_) => None,
        }
    }

    pub fn into_state(self) -> Option<AuthState> {
        match self {
            Self::Completed(state) => Some(state),
            Self::Redirect { .. } => None,
        }
    }
}

/// What the host does next after [`AuthSource::logout`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogoutOutcome {
    /// Send the browser to `location` for single logout.
    Redirect { location: String },
    /// Logout is complete; hand the state back to the caller.
    Completed(AuthState),
    /// No PAPI session and no logout in progress.
    NotRequired,
}

/// The host's pluggable authentication source interface.
pub trait AuthSource {
    /// Id of this source instance in the host configuration.
    fn auth_id(&self) -> &str;

    fn authenticate(
        &mut self,
        state: AuthState,
        params: &RequestParams,
    ) -> Result<AuthOutcome, PapiError>;

    fn logout(
        &mut self,
        state: AuthState,
        params: &RequestParams,
    ) -> Result<LogoutOutcome, PapiError>;
}

/// Authentication source backed by a PAPI point of access.
pub struct PapiSource<P> {
    auth_id: String,
    config: SourceConfig,
    store: Arc<dyn StateStore>,
    poa: P,
}

impl<P: PointOfAccess> PapiSource<P> {
    /// Validates `config`, then binds the point of access to its site with
    /// `connect`. A configuration error is returned before `connect` runs.
    pub fn new<F>(
        auth_id: impl Into<String>,
        config: SourceConfig,
        store: Arc<dyn StateStore>,
        connect: F,
    ) -> Result<Self, PapiError>
    where
        F: FnOnce(&str) -> Result<P, PapiError>,
    {
        let config = config.normalize()?;
        let poa = connect(&config.site)?;

        Ok(Self {
            auth_id: auth_id.into(),
            config,
            store,
            poa,
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn poa(&self) -> &P {
        &self.poa
    }

    pub fn poa_mut(&mut self) -> &mut P {
        &mut self.poa
    }

    /// Tags `state` with this source and parks it in the store.
    fn park(&self, state: &mut AuthState) -> Result<String, PapiError> {
        state.insert(keys::AUTH_ID, self.auth_id.clone());
        self.store.save_state(state, STAGE_INIT)
    }

    fn hints(&self, papiopoa: Option<String>, state_id: String) -> RedirectHints {
        RedirectHints {
            hli: self.config.hli.clone(),
            papiopoa,
            state_id,
        }
    }
}

impl<P: PointOfAccess> AuthSource for PapiSource<P> {
    fn auth_id(&self) -> &str {
        &self.auth_id
    }

    fn authenticate(
        &mut self,
        mut state: AuthState,
        params: &RequestParams,
    ) -> Result<AuthOutcome, PapiError> {
        let mut papiopoa = None;
        if state.contains_key(keys::SP_METADATA) {
            papiopoa = state.sp_entity_id().map(str::to_string);
            state.remove(keys::RELAY_STATE);
        }
        normalize_relay_state(&mut state);

        if let Some(handle) = params.get(CALLER_STATE_PARAM) {
            tracing::debug!(auth_id = %self.auth_id, "resuming caller flow");
            state = self.store.load_state(handle, STAGE_INIT)?;
        } else if let Some(handle) = params.get(STATE_ID_PARAM) {
            tracing::debug!(auth_id = %self.auth_id, "resuming after PAPI redirect");
            state = self.store.load_state(handle, STAGE_INIT)?;
        } else if !self.poa.is_authenticated()? {
            let state_id = self.park(&mut state)?;
            let hints = self.hints(papiopoa, state_id);
            self.poa
                .add_hook(HookEvent::RedirectUrlFinish, hints.into_hook());
            tracing::debug!(
                auth_id = %self.auth_id,
                event = %HookEvent::RedirectUrlFinish,
                "state parked for PAPI login"
            );
        } else {
            tracing::debug!(auth_id = %self.auth_id, "PAPI session already established");
        }

        if let PoaOutcome::Redirect { location } = self.poa.authenticate()? {
            return Ok(AuthOutcome::Redirect { location });
        }

        if let Some(raw) = self.poa.attributes()? {
            let attributes = normalize_attributes(raw);
            tracing::info!(
                auth_id = %self.auth_id,
                attributes = attributes.len(),
                "PAPI authentication completed"
            );
            state.insert(keys::ATTRIBUTES, Value::Object(attributes));
        } else {
            tracing::info!(auth_id = %self.auth_id, "PAPI authentication completed without attributes");
        }

        Ok(AuthOutcome::Completed(state))
    }

    fn logout(
        &mut self,
        mut state: AuthState,
        params: &RequestParams,
    ) -> Result<LogoutOutcome, PapiError> {
        if self.poa.is_authenticated()? {
            let state_id = self.park(&mut state)?;
            let hints = self.hints(None, state_id);
            // The library has no hook after single logout, so a redirect here
            // never comes back through this branch.
            self.poa
                .add_hook(HookEvent::SloRedirectUrlFinish, hints.into_hook());
            tracing::debug!(
                auth_id = %self.auth_id,
                event = %HookEvent::SloRedirectUrlFinish,
                "state parked for PAPI logout"
            );

            if let PoaOutcome::Redirect { location } = self.poa.logout(true)? {
                return Ok(LogoutOutcome::Redirect { location });
            }
        } else if let Some(handle) = params.get(STATE_ID_PARAM) {
            tracing::debug!(auth_id = %self.auth_id, "resuming logout");
            state = self.store.load_state(handle, STAGE_INIT)?;
        } else {
            return Ok(LogoutOutcome::NotRequired);
        }

        tracing::info!(auth_id = %self.auth_id, "PAPI logout completed");
        Ok(LogoutOutcome::Completed(state))
    }
}

impl<P: fmt::Debug> fmt::Debug for PapiSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PapiSource")
            .field("auth_id", &self.auth_id)
            .field("config", &self.config)
            .field("poa", &self.poa)
            .finish_non_exhaustive()
    }
}

/// Id of the source that parked the state referenced by `SSPStateID`, so the
/// host can route a returning browser to it. `None` without the parameter.
pub fn resume_auth_id(
    store: &dyn StateStore,
    params: &RequestParams,
) -> Result<Option<String>, PapiError> {
    let Some(handle) = params.get(STATE_ID_PARAM) else {
        return Ok(None);
    };
    let state = store.load_state(handle, STAGE_INIT)?;
    Ok(state.auth_id().map(str::to_string))
}

/// Gives the state a relay state and reduces it to the value of its last
/// `&RelayState=` assignment, dropping anything prepended to it.
fn normalize_relay_state(state: &mut AuthState) {
    if matches!(state.get(keys::RELAY_STATE), None | Some(Value::Null)) {
        state.set_relay_state(format!("{RELAY_STATE_MARKER}{}", unique_token()));
    }

    if let Some(value) = state.relay_state().and_then(extract_relay_state) {
        state.set_relay_state(value);
    }
}
