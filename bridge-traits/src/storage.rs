//! Secure Storage Abstraction
//!
//! Durable storage for the pairing credential.

use async_trait::async_trait;

use crate::error::Result;

/// Secure credential storage trait
///
/// Abstracts secure storage mechanisms:
/// - macOS/iOS: Keychain
/// - Android: Keystore (hardware-backed when available)
/// - Desktop: permission-restricted files under the application data directory
///
/// # Durability Requirements
///
/// Implementations MUST:
/// - Replace an existing value atomically (write-to-temp-then-rename or the
///   platform equivalent) so a crash mid-write never leaves a torn value
/// - Never log or expose stored values
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::SecureStore;
///
/// async fn store_credential(store: &dyn SecureStore, raw: &[u8]) -> Result<()> {
///     store.set_secret("pairing_credential:00008030-001A", raw).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Store a secret value, atomically replacing any previous value.
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve a secret value
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a secret. Deleting a missing key is not an error.
    async fn delete_secret(&self, key: &str) -> Result<()>;

    /// Check if a secret exists without retrieving it
    async fn has_secret(&self, key: &str) -> Result<bool> {
        Ok(self.get_secret(key).await?.is_some())
    }

    /// List all secret keys (without values)
    async fn list_keys(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait]
        impl SecureStore for Store {
            async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;
            async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;
            async fn delete_secret(&self, key: &str) -> Result<()>;
            async fn list_keys(&self) -> Result<Vec<String>>;
        }
    }

    #[tokio::test]
    async fn test_has_secret_uses_get_secret() {
        let mut store = MockStore::new();
        store
            .expect_get_secret()
            .withf(|key| key == "present")
            .returning(|_| Ok(Some(vec![1, 2, 3])));
        store
            .expect_get_secret()
            .withf(|key| key == "absent")
            .returning(|_| Ok(None));

        assert!(store.has_secret("present").await.unwrap());
        assert!(!store.has_secret("absent").await.unwrap());
    }
}
