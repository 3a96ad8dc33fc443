//! Pairing credential persistence
//!
//! Credentials are stored through the host's `SecureStore` under
//! `pairing_credential:<device_id>`. A second entry,
//! `active_pairing_credential`, names the device whose credential the engine
//! reloads on startup. The store is expected to replace values atomically so
//! a crash during re-import leaves either the old or the new credential.

use crate::credential::PairingCredential;
use crate::error::{PairingError, Result};
use bridge_traits::storage::SecureStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CREDENTIAL_KEY_PREFIX: &str = "pairing_credential:";
const ACTIVE_CREDENTIAL_KEY: &str = "active_pairing_credential";

#[derive(Clone)]
pub struct CredentialStore {
    secure_store: Arc<dyn SecureStore>,
}

impl CredentialStore {
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self { secure_store }
    }

    fn storage_key(device_id: &str) -> String {
        format!("{}{}", CREDENTIAL_KEY_PREFIX, device_id)
    }

    /// Persist a credential and mark it as the active one.
    pub async fn save(&self, credential: &PairingCredential) -> Result<()> {
        let bytes = credential.to_bytes()?;
        let key = Self::storage_key(credential.device_id());

        self.secure_store
            .set_secret(&key, &bytes)
            .await
            .map_err(|e| {
                warn!(device_id = credential.device_id(), error = %e, "Failed to persist credential");
                PairingError::StorageError(e.to_string())
            })?;

        self.secure_store
            .set_secret(ACTIVE_CREDENTIAL_KEY, credential.device_id().as_bytes())
            .await?;

        info!(device_id = credential.device_id(), "Pairing credential stored");
        Ok(())
    }

    /// Load the credential for `device_id`.
    ///
    /// A stored value that no longer validates is deleted and reported as
    /// absent, so a corrupted entry cannot wedge startup.
    pub async fn load(&self, device_id: &str) -> Result<Option<PairingCredential>> {
        let key = Self::storage_key(device_id);
        let Some(bytes) = self.secure_store.get_secret(&key).await? else {
            debug!(device_id = device_id, "No stored credential");
            return Ok(None);
        };

        match PairingCredential::parse(&bytes) {
            Ok(credential) if credential.device_id() == device_id => Ok(Some(credential)),
            Ok(_) | Err(_) => {
                warn!(device_id = device_id, "Stored credential is corrupted, removing it");
                self.delete(device_id).await?;
                Ok(None)
            }
        }
    }

    /// Load the credential the engine last imported.
    pub async fn load_active(&self) -> Result<Option<PairingCredential>> {
        let Some(raw) = self.secure_store.get_secret(ACTIVE_CREDENTIAL_KEY).await? else {
            return Ok(None);
        };

        let device_id = match String::from_utf8(raw) {
            Ok(id) => id,
            Err(_) => {
                warn!("Active credential pointer is not UTF-8, clearing it");
                self.secure_store.delete_secret(ACTIVE_CREDENTIAL_KEY).await?;
                return Ok(None);
            }
        };

        self.load(&device_id).await
    }

    /// Remove the credential for `device_id`, and the active pointer if it
    /// referenced that device.
    pub async fn delete(&self, device_id: &str) -> Result<()> {
        self.secure_store
            .delete_secret(&Self::storage_key(device_id))
            .await?;

        let active = self.secure_store.get_secret(ACTIVE_CREDENTIAL_KEY).await?;
        if active.as_deref() == Some(device_id.as_bytes()) {
            self.secure_store.delete_secret(ACTIVE_CREDENTIAL_KEY).await?;
        }

        info!(device_id = device_id, "Pairing credential deleted");
        Ok(())
    }

    /// Device ids that have a stored credential.
    pub async fn stored_device_ids(&self) -> Result<Vec<String>> {
        let keys = self.secure_store.list_keys().await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(CREDENTIAL_KEY_PREFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::fixtures::credential_bytes;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use mockall::mock;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    mock! {
        pub Store {}

        #[async_trait]
        impl SecureStore for Store {
            async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()>;
            async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>>;
            async fn delete_secret(&self, key: &str) -> BridgeResult<()>;
            async fn list_keys(&self) -> BridgeResult<Vec<String>>;
        }
    }

    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl SecureStore for MapStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
            self.entries.lock().await.insert(key.to_string(), value.to_vec());
            Ok(())
        }
        async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
            Ok(self.entries.lock().await.get(key).cloned())
        }
        async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
            self.entries.lock().await.remove(key);
            Ok(())
        }
        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(self.entries.lock().await.keys().cloned().collect())
        }
    }

    fn credential(device_id: &str) -> PairingCredential {
        PairingCredential::parse(&credential_bytes(device_id)).unwrap()
    }

    #[tokio::test]
    async fn test_save_then_load_active() {
        let store = CredentialStore::new(Arc::new(MapStore::default()));

        store.save(&credential("D1")).await.unwrap();
        store.save(&credential("D2")).await.unwrap();

        let active = store.load_active().await.unwrap().unwrap();
        assert_eq!(active.device_id(), "D2");

        let mut ids = store.stored_device_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["D1".to_string(), "D2".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_clears_active_pointer() {
        let store = CredentialStore::new(Arc::new(MapStore::default()));
        store.save(&credential("D1")).await.unwrap();

        store.delete("D1").await.unwrap();

        assert!(store.load("D1").await.unwrap().is_none());
        assert!(store.load_active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_removed() {
        let backing = Arc::new(MapStore::default());
        backing
            .set_secret("pairing_credential:D1", b"{\"device_id\":\"D1\"}")
            .await
            .unwrap();
        backing
            .set_secret("active_pairing_credential", b"D1")
            .await
            .unwrap();

        let store = CredentialStore::new(backing.clone());
        assert!(store.load_active().await.unwrap().is_none());
        assert!(backing.entries.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_maps_to_storage_error() {
        let mut mock = MockStore::new();
        mock.expect_set_secret()
            .withf(|key, _| key == "pairing_credential:D1")
            .returning(|_, _| Err(BridgeError::OperationFailed("disk full".to_string())));

        let store = CredentialStore::new(Arc::new(mock));
        let err = store.save(&credential("D1")).await.unwrap_err();

        assert!(matches!(err, PairingError::StorageError(ref m) if m.contains("disk full")));
    }
}
