//! File-backed secure storage with atomic replacement

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bridge_traits::{
    error::{BridgeError, Result},
    storage::SecureStore,
};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SECRET_EXTENSION: &str = "secret";

/// Stores each secret in its own file under a private directory.
///
/// Writes go to a uniquely named temporary file in the same directory, are
/// flushed to disk, and are then renamed over the destination. A crash at any
/// point leaves either the previous value or the new one, never a torn file.
///
/// File names are the URL-safe base64 encoding of the key, so keys such as
/// `pairing_credential:<device id>` are valid on every desktop filesystem.
pub struct FileSecureStore {
    root: PathBuf,
}

impl FileSecureStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform data directory (`<data dir>/tether/credentials`).
    pub fn in_default_location() -> Result<Self> {
        let base = dirs::data_local_dir().ok_or_else(|| {
            BridgeError::NotAvailable("No local data directory on this platform".to_string())
        })?;
        Ok(Self::new(base.join("tether").join("credentials")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.root.join(format!("{}.{}", name, SECRET_EXTENSION))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != SECRET_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let raw = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(raw).ok()
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(())
    }

    async fn write_atomically(&self, destination: &Path, value: &[u8]) -> Result<()> {
        let suffix: u64 = rand::thread_rng().gen();
        let temp = destination.with_extension(format!("tmp-{:016x}", suffix));

        let result = async {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(&temp).await?;
            file.write_all(value).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(&temp, destination).await?;
            sync_directory(&self.root).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %e, "Failed to clean up temporary secret file");
                }
            }
        }
        result
    }
}

#[cfg(unix)]
async fn sync_directory(dir: &Path) -> Result<()> {
    let handle = fs::File::open(dir).await?;
    handle.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_directory(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_root().await?;
        let destination = self.path_for(key);
        self.write_atomically(&destination, value).await?;

        debug!(key = key, "Stored secret");
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = key, "Secret not found");
                Ok(None)
            }
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                debug!(key = key, "Deleted secret");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BridgeError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = Self::key_from_path(&entry.path()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
