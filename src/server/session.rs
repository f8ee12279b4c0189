use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The session credential produced by a successful authentication: the
/// account identifier and the bearer token authorizing report fetches.
///
/// Created once per authentication and immutable afterwards. The crate
/// never refreshes or invalidates it; on a 401/403 the caller must
/// re-authenticate and substitute a fresh credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Apple directory services identifier.
    pub dsid: String,
    /// Bearer token for the report-fetch endpoint.
    #[serde(rename = "searchPartyToken")]
    pub search_party_token: String,
}

/// Externally-owned persistence for the session credential.
pub trait CredentialStore {
    /// Return the stored credential, if any.
    fn load(&self) -> Result<Option<SessionCredential>>;
    /// Persist `credential`, replacing any previous one.
    fn save(&self, credential: &SessionCredential) -> Result<()>;
}

/// A volatile store, mostly useful in tests and one-shot tools.
#[derive(Default)]
pub struct MemoryCredentialStore(Mutex<Option<SessionCredential>>);

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<SessionCredential>> {
        Ok(self.0.lock().expect("store mutex poisoned").clone())
    }

    fn save(&self, credential: &SessionCredential) -> Result<()> {
        *self.0.lock().expect("store mutex poisoned") = Some(credential.clone());
        Ok(())
    }
}
