//! Authentication state and the host store it is persisted in across the
//! PAPI redirect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::PapiError;
use crate::helpers::{now_secs, random_token};

/// Stage tag for contexts persisted before the PAPI redirect.
pub const STAGE_INIT: &str = "papi:init";

const DEFAULT_STATE_TTL_SECS: u64 = 300;
const HANDLE_LEN: usize = 32;

/// Well-known keys of an [`AuthState`].
pub mod keys {
    /// Caller's relay state.
    pub const RELAY_STATE: &str = "saml:RelayState";
    /// Service provider metadata; `entityid` becomes the `PAPIOPOA` hint.
    pub const SP_METADATA: &str = "SPMetadata";
    pub const SP_ENTITY_ID: &str = "entityid";
    /// Translated user attributes.
    pub const ATTRIBUTES: &str = "Attributes";
    /// Id of the source instance that must resume the flow.
    pub const AUTH_ID: &str = "papi:AuthId";
}

/// An in-progress authentication (or logout) transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthState(Map<String, Value>);

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.get_str(keys::RELAY_STATE)
    }

    pub fn set_relay_state(&mut self, relay_state: impl Into<String>) {
        let relay_state: String = relay_state.into();
        self.insert(keys::RELAY_STATE, relay_state);
    }

    /// `SPMetadata.entityid`, when the caller supplied metadata with one.
    pub fn sp_entity_id(&self) -> Option<&str> {
        self.get(keys::SP_METADATA)?
            .get(keys::SP_ENTITY_ID)?
            .as_str()
    }

    pub fn auth_id(&self) -> Option<&str> {
        self.get_str(keys::AUTH_ID)
    }

    pub fn attributes(&self) -> Option<&Map<String, Value>> {
        self.get(keys::ATTRIBUTES).and_then(Value::as_object)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for AuthState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for AuthState {
    type Error = PapiError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(value)?)
    }
}

/// The host's store for contexts that must survive a redirect.
///
/// `save_state` returns an opaque handle; `load_state` must reject a handle
/// saved under a different stage. The store is the trust boundary for
/// handles: a forged handle must not load.
pub trait StateStore: Send + Sync {
    fn save_state(&self, state: &AuthState, stage: &str) -> Result<String, PapiError>;

    fn load_state(&self, handle: &str, stage: &str) -> Result<AuthState, PapiError>;
}

#[derive(Debug, Clone)]
struct StoredState {
    stage: String,
    exp: u64,
    state: AuthState,
}

/// Process-local [`StateStore`] with random handles and a fixed lifetime.
///
/// Loading does not consume an entry, so a reload of the return URL resumes
/// the same flow. Expired entries are purged on save.
#[derive(Debug)]
pub struct InMemoryStateStore {
    ttl_secs: u64,
    states: Mutex<HashMap<String, StoredState>>,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_STATE_TTL_SECS)
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero TTL falls back to the default lifetime.
    pub fn with_ttl(ttl_secs: u64) -> Self {
        Self {
            ttl_secs: if ttl_secs == 0 {
                DEFAULT_STATE_TTL_SECS
            } else {
                ttl_secs
            },
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|states| states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for InMemoryStateStore {
    fn save_state(&self, state: &AuthState, stage: &str) -> Result<String, PapiError> {
        let now = now_secs();
        let mut states = self
            .states
            .lock()
            .map_err(|_| PapiError::Internal("state store mutex poisoned".to_string()))?;
        states.retain(|_, stored| stored.exp > now);

        let handle = random_token(HANDLE_LEN);
        states.insert(
            handle.clone(),
            StoredState {
                stage: stage.to_string(),
                exp: now.saturating_add(self.ttl_secs),
                state: state.clone(),
            },
        );
        Ok(handle)
    }

    fn load_state(&self, handle: &str, stage: &str) -> Result<AuthState, PapiError> {
        let states = self
            .states
            .lock()
            .map_err(|_| PapiError::Internal("state store mutex poisoned".to_string()))?;

        let stored = match states.get(handle) {
            Some(stored) if stored.exp > now_secs() => stored,
            _ => {
                tracing::warn!(stage, "rejected unknown or expired state handle");
                return Err(PapiError::StateNotFound(stage.to_string()));
            }
        };

        if stored.stage != stage {
            tracing::warn!(
                expected = stage,
                found = %stored.stage,
                "rejected state handle saved under another stage"
            );
            return Err(PapiError::StageMismatch {
                expected: stage.to_string(),
                found: stored.stage.clone(),
            });
        }

        Ok(stored.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caller_state() -> AuthState {
        AuthState::try_from(json!({
            "saml:RelayState": "https://sp.test/after-login",
            "SPMetadata": {"entityid": "https://sp.test/metadata"},
            "ReturnURL": "https://sp.test/acs",
            "nested": {"list": [1, 2, 3]}
        }))
        .expect("object converts")
    }

    #[test]
    fn well_known_accessors() {
        let state = caller_state();
        assert_eq!(state.relay_state(), Some("https://sp.test/after-login"));
        assert_eq!(state.sp_entity_id(), Some("https://sp.test/metadata"));
        assert_eq!(state.auth_id(), None);
        assert!(state.attributes().is_none());

        let state = AuthState::try_from(json!({"SPMetadata": {"name": "no id"}})).unwrap();
        assert_eq!(state.sp_entity_id(), None);
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(AuthState::try_from(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn in_memory_roundtrip_preserves_caller_keys() {
        let store = InMemoryStateStore::new();
        let state = caller_state();

        let handle = store.save_state(&state, STAGE_INIT).expect("save works");
        assert_eq!(handle.len(), HANDLE_LEN);

        let loaded = store.load_state(&handle, STAGE_INIT).expect("load works");
        assert_eq!(loaded, state);

        // Loading does not consume the entry.
        assert!(store.load_state(&handle, STAGE_INIT).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn in_memory_handles_are_distinct() {
        let store = InMemoryStateStore::new();
        let first = store.save_state(&caller_state(), STAGE_INIT).unwrap();
        let second = store.save_state(&caller_state(), STAGE_INIT).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn in_memory_huge_ttl_never_expires() {
        let store = InMemoryStateStore::with_ttl(u64::MAX);
        let handle = store.save_state(&caller_state(), STAGE_INIT).unwrap();
        assert_eq!(
            store.load_state(&handle, STAGE_INIT).unwrap(),
            caller_state()
        );

        // A later save purges nothing.
        store.save_state(&caller_state(), STAGE_INIT).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn in_memory_rejects_unknown_handle_and_wrong_stage() {
        let store = InMemoryStateStore::new();
        let handle = store.save_state(&caller_state(), STAGE_INIT).unwrap();

        let err = store.load_state("forged", STAGE_INIT).unwrap_err();
        assert!(matches!(err, PapiError::StateNotFound(_)));
        assert!(err.is_invalid_handle());

        let err = store.load_state(&handle, "other:stage").unwrap_err();
        match err {
            PapiError::StageMismatch { expected, found } => {
                assert_eq!(expected, "other:stage");
                assert_eq!(found, STAGE_INIT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
