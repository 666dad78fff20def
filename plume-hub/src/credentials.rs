use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use plume_core::{ApiCredential, BoxStr, CredentialKind, CredentialRef};
use plume_upstream::{Upstream, UpstreamError};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential {0} not found")]
    NotFound(CredentialRef),
    #[error("credential {0} is not a v1 read key")]
    WrongKind(CredentialRef),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Owner of every API credential. Registrations hold a [`CredentialRef`];
/// the same v1 key added twice resolves to the same entry.
#[derive(Clone, Default)]
pub struct CredentialStore {
    entries: Arc<RwLock<HashMap<CredentialRef, ApiCredential>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential, returning the existing reference when the same
    /// key is already known. The flag is `true` for a new entry.
    pub async fn insert(&self, kind: CredentialKind, value: &str) -> (CredentialRef, bool) {
        let value = value.trim();
        let mut entries = self.entries.write().await;

        if let Some((id, _)) = entries
            .iter()
            .find(|(_, c)| c.kind == kind && &*c.value == value)
        {
            return (*id, false);
        }

        let id = CredentialRef::new();
        entries.insert(
            id,
            ApiCredential {
                kind,
                value: BoxStr::from(value),
                validated: false,
            },
        );
        debug!(credential = %id, kind = kind.as_str(), "Stored credential");
        (id, true)
    }

    /// Put back a credential loaded from persistent storage.
    pub async fn restore(&self, id: CredentialRef, credential: ApiCredential) {
        self.entries.write().await.insert(id, credential);
    }

    pub async fn get(&self, id: CredentialRef) -> Option<ApiCredential> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn find(&self, kind: CredentialKind, value: &str) -> Option<CredentialRef> {
        let value = value.trim();
        self.entries
            .read()
            .await
            .iter()
            .find(|(_, c)| c.kind == kind && &*c.value == value)
            .map(|(id, _)| *id)
    }

    /// The account key to reuse without prompting: only when exactly one
    /// validated v1 key is known.
    pub async fn shared_read_key(&self) -> Option<CredentialRef> {
        let entries = self.entries.read().await;
        let mut validated = entries
            .iter()
            .filter(|(_, c)| c.kind == CredentialKind::V1ReadKey && c.validated);

        match (validated.next(), validated.next()) {
            (Some((id, _)), None) => Some(*id),
            _ => None,
        }
    }

    pub async fn mark_validated(&self, id: CredentialRef) -> Result<ApiCredential, CredentialError> {
        let mut entries = self.entries.write().await;
        let credential = entries.get_mut(&id).ok_or(CredentialError::NotFound(id))?;
        credential.validated = true;
        Ok(credential.clone())
    }

    /// Check a v1 key against the upstream. The store lock is not held
    /// across the network call; already-validated keys are not re-checked.
    pub async fn validate<U: Upstream>(
        &self,
        id: CredentialRef,
        upstream: &U,
    ) -> Result<ApiCredential, CredentialError> {
        let credential = self.get(id).await.ok_or(CredentialError::NotFound(id))?;

        if credential.kind != CredentialKind::V1ReadKey {
            return Err(CredentialError::WrongKind(id));
        }

        if credential.validated {
            return Ok(credential);
        }

        upstream.check_read_key(&credential.value).await?;
        self.mark_validated(id).await
    }

    pub async fn remove(&self, id: CredentialRef) -> Option<ApiCredential> {
        self.entries.write().await.remove(&id)
    }

    /// Drop every credential not in `referenced`, returning what was dropped.
    pub async fn retain_referenced(&self, referenced: &HashSet<CredentialRef>) -> Vec<CredentialRef> {
        let mut entries = self.entries.write().await;
        let unused: Vec<_> = entries
            .keys()
            .filter(|id| !referenced.contains(*id))
            .copied()
            .collect();

        for id in &unused {
            entries.remove(id);
        }
        unused
    }

    pub async fn entries(&self) -> Vec<(CredentialRef, ApiCredential)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect()
    }
}
