//! In-memory host services for tests.
//!
//! ## MemoryDevice
//!
//! `MemoryDevice` behaves like a device whose media database only exposes
//! record-level operations: uploads, record writes and playlist mutations take
//! effect immediately, and `commit` merely closes the transaction. A failed
//! commit therefore leaves applied steps behind unless the caller compensates.
//!
//! ## MemorySecureStore
//!
//! A `SecureStore` backed by a map, with an optional write failure switch.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::device::{
    Ack, DeviceCapabilities, DevicePlaylist, DeviceTransport, MediaRecord, PairingMaterial,
    PlaylistOperation, SessionHandle, TransactionHandle,
};
use crate::error::{BridgeError, Result, TransportError, TransportResult};
use crate::storage::SecureStore;

#[derive(Default)]
struct Faults {
    open: VecDeque<TransportError>,
    probe: VecDeque<TransportError>,
    upload: VecDeque<TransportError>,
    write_record: VecDeque<TransportError>,
    playlist_op: VecDeque<TransportError>,
    commit: VecDeque<TransportError>,
    begin_write: VecDeque<TransportError>,
    revoked: bool,
    unreachable: bool,
    fail_compensation: bool,
    probe_delay: Option<Duration>,
    commit_delay: Option<Duration>,
}

#[derive(Default)]
struct DeviceState {
    records: HashMap<String, MediaRecord>,
    files: HashMap<String, Bytes>,
    playlists: BTreeMap<String, Vec<String>>,
    sessions: HashSet<String>,
    transactions: HashSet<String>,
    next_id: u64,
    probe_count: u64,
    opened_sessions: u64,
    commits: u64,
    active_writers: usize,
    max_concurrent_writers: usize,
    probing: bool,
    probe_during_write: bool,
    applied_playlist_ops: Vec<(String, PlaylistOperation)>,
}

/// Scriptable in-memory device.
pub struct MemoryDevice {
    device_id: String,
    capabilities: DeviceCapabilities,
    state: Mutex<DeviceState>,
    faults: Mutex<Faults>,
}

impl MemoryDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            capabilities: DeviceCapabilities {
                product_version: "17.4".to_string(),
                supports_ringtones: true,
                native_transactions: false,
            },
            state: Mutex::new(DeviceState::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Override the capabilities reported by new sessions.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // ---- fault injection ----

    pub async fn fail_next_open(&self, error: TransportError) {
        self.faults.lock().await.open.push_back(error);
    }

    pub async fn fail_next_probes(&self, count: usize, error: TransportError) {
        let mut faults = self.faults.lock().await;
        for _ in 0..count {
            faults.probe.push_back(error.clone());
        }
    }

    pub async fn fail_next_begin_write(&self, error: TransportError) {
        self.faults.lock().await.begin_write.push_back(error);
    }

    pub async fn fail_next_upload(&self, error: TransportError) {
        self.faults.lock().await.upload.push_back(error);
    }

    pub async fn fail_next_write_record(&self, error: TransportError) {
        self.faults.lock().await.write_record.push_back(error);
    }

    pub async fn fail_next_playlist_op(&self, error: TransportError) {
        self.faults.lock().await.playlist_op.push_back(error);
    }

    pub async fn fail_next_commits(&self, count: usize, error: TransportError) {
        let mut faults = self.faults.lock().await;
        for _ in 0..count {
            faults.commit.push_back(error.clone());
        }
    }

    /// Reject every future session open as if the host was un-trusted.
    pub async fn revoke_trust(&self, revoked: bool) {
        self.faults.lock().await.revoked = revoked;
    }

    /// Make the device unreachable: opens fail and probes time out.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().await.unreachable = unreachable;
    }

    pub async fn fail_compensation(&self, fail: bool) {
        self.faults.lock().await.fail_compensation = fail;
    }

    pub async fn set_probe_delay(&self, delay: Option<Duration>) {
        self.faults.lock().await.probe_delay = delay;
    }

    pub async fn set_commit_delay(&self, delay: Option<Duration>) {
        self.faults.lock().await.commit_delay = delay;
    }

    /// Drop every open session as if the device disconnected.
    pub async fn drop_sessions(&self) {
        self.state.lock().await.sessions.clear();
    }

    // ---- inspection ----

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn record(&self, fingerprint: &str) -> Option<MediaRecord> {
        self.state.lock().await.records.get(fingerprint).cloned()
    }

    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }

    pub async fn has_file(&self, locator: &str) -> bool {
        self.state.lock().await.files.contains_key(locator)
    }

    pub async fn playlist(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().await.playlists.get(name).cloned()
    }

    pub async fn probe_count(&self) -> u64 {
        self.state.lock().await.probe_count
    }

    pub async fn opened_sessions(&self) -> u64 {
        self.state.lock().await.opened_sessions
    }

    pub async fn commit_count(&self) -> u64 {
        self.state.lock().await.commits
    }

    pub async fn max_concurrent_writers(&self) -> usize {
        self.state.lock().await.max_concurrent_writers
    }

    /// Whether a probe was ever observed while a write transaction was open.
    pub async fn probe_overlapped_write(&self) -> bool {
        self.state.lock().await.probe_during_write
    }

    pub async fn applied_playlist_ops(&self) -> Vec<(String, PlaylistOperation)> {
        self.state.lock().await.applied_playlist_ops.clone()
    }

    // ---- seeding ----

    pub async fn insert_record(&self, record: MediaRecord) {
        self.state
            .lock()
            .await
            .records
            .insert(record.fingerprint.clone(), record);
    }

    pub async fn insert_playlist(&self, name: impl Into<String>, members: Vec<String>) {
        self.state.lock().await.playlists.insert(name.into(), members);
    }

    async fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut VecDeque<TransportError>) -> TransportResult<()> {
        let mut faults = self.faults.lock().await;
        match pick(&mut faults).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn ensure_session(state: &DeviceState, session_id: &str) -> TransportResult<()> {
        if state.sessions.contains(session_id) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }

    fn ensure_transaction(state: &DeviceState, tx: &TransactionHandle) -> TransportResult<()> {
        Self::ensure_session(state, &tx.session_id)?;
        if state.transactions.contains(&tx.id) {
            Ok(())
        } else {
            Err(TransportError::UnknownTransaction(tx.id.clone()))
        }
    }

    fn finish_transaction(state: &mut DeviceState, tx: &TransactionHandle) {
        if state.transactions.remove(&tx.id) {
            state.active_writers = state.active_writers.saturating_sub(1);
        }
    }
}

#[async_trait]
impl DeviceTransport for MemoryDevice {
    async fn open_session(&self, material: &PairingMaterial) -> TransportResult<SessionHandle> {
        self.take_fault(|f| &mut f.open).await?;
        {
            let faults = self.faults.lock().await;
            if faults.unreachable {
                return Err(TransportError::Unreachable(format!(
                    "{} not connected",
                    self.device_id
                )));
            }
            if faults.revoked {
                return Err(TransportError::TrustRejected(
                    "pairing record revoked by device".to_string(),
                ));
            }
        }
        if material.device_id != self.device_id {
            return Err(TransportError::TrustRejected(format!(
                "credential issued for {}",
                material.device_id
            )));
        }

        let mut state = self.state.lock().await;
        state.next_id += 1;
        state.opened_sessions += 1;
        let id = format!("session-{}", state.next_id);
        state.sessions.insert(id.clone());
        Ok(SessionHandle {
            id,
            device_id: self.device_id.clone(),
            capabilities: self.capabilities.clone(),
        })
    }

    async fn probe(&self, session: &SessionHandle) -> TransportResult<Ack> {
        let (delay, unreachable) = {
            let faults = self.faults.lock().await;
            (faults.probe_delay, faults.unreachable)
        };
        {
            let mut state = self.state.lock().await;
            Self::ensure_session(&state, &session.id)?;
            state.probing = true;
            if state.active_writers > 0 {
                state.probe_during_write = true;
            }
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.take_fault(|f| &mut f.probe).await;
        let mut state = self.state.lock().await;
        state.probing = false;
        state.probe_count += 1;
        scripted?;
        if unreachable {
            return Err(TransportError::Timeout);
        }
        Self::ensure_session(&state, &session.id)?;
        Ok(Ack {
            sequence: state.probe_count,
        })
    }

    async fn close_session(&self, session: &SessionHandle) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        state.sessions.remove(&session.id);
        Ok(())
    }

    async fn list_library_fingerprints(
        &self,
        session: &SessionHandle,
    ) -> TransportResult<HashSet<String>> {
        let state = self.state.lock().await;
        Self::ensure_session(&state, &session.id)?;
        Ok(state.records.keys().cloned().collect())
    }

    async fn begin_write(&self, session: &SessionHandle) -> TransportResult<TransactionHandle> {
        self.take_fault(|f| &mut f.begin_write).await?;
        let mut state = self.state.lock().await;
        Self::ensure_session(&state, &session.id)?;
        if state.probing {
            state.probe_during_write = true;
        }
        state.next_id += 1;
        let id = format!("tx-{}", state.next_id);
        state.transactions.insert(id.clone());
        state.active_writers += 1;
        state.max_concurrent_writers = state.max_concurrent_writers.max(state.active_writers);
        Ok(TransactionHandle {
            id,
            session_id: session.id.clone(),
        })
    }

    async fn upload_file(
        &self,
        tx: &TransactionHandle,
        locator: &str,
        bytes: Bytes,
    ) -> TransportResult<()> {
        self.take_fault(|f| &mut f.upload).await?;
        let mut state = self.state.lock().await;
        Self::ensure_transaction(&state, tx)?;
        state.files.insert(locator.to_string(), bytes);
        Ok(())
    }

    async fn write_record(&self, tx: &TransactionHandle, record: &MediaRecord) -> TransportResult<()> {
        self.take_fault(|f| &mut f.write_record).await?;
        let mut state = self.state.lock().await;
        Self::ensure_transaction(&state, tx)?;
        if state.records.contains_key(&record.fingerprint) {
            return Err(TransportError::Rejected(format!(
                "record {} already exists",
                record.fingerprint
            )));
        }
        state
            .records
            .insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn apply_playlist_op(
        &self,
        tx: &TransactionHandle,
        playlist: &str,
        op: &PlaylistOperation,
    ) -> TransportResult<()> {
        self.take_fault(|f| &mut f.playlist_op).await?;
        let mut state = self.state.lock().await;
        Self::ensure_transaction(&state, tx)?;

        if let PlaylistOperation::Add { fingerprint, .. } = op {
            if !state.records.contains_key(fingerprint) {
                return Err(TransportError::Rejected(format!(
                    "record {} not in library",
                    fingerprint
                )));
            }
        }

        match op {
            PlaylistOperation::Create => {
                if state.playlists.contains_key(playlist) {
                    return Err(TransportError::Rejected(format!(
                        "playlist {} already exists",
                        playlist
                    )));
                }
                state.playlists.insert(playlist.to_string(), Vec::new());
            }
            PlaylistOperation::Delete => {
                if state.playlists.remove(playlist).is_none() {
                    return Err(TransportError::Rejected(format!(
                        "playlist {} does not exist",
                        playlist
                    )));
                }
            }
            other => {
                let members = state.playlists.get_mut(playlist).ok_or_else(|| {
                    TransportError::Rejected(format!("playlist {} does not exist", playlist))
                })?;
                other.apply_to(members).map_err(TransportError::Rejected)?;
            }
        }
        state
            .applied_playlist_ops
            .push((playlist.to_string(), op.clone()));
        Ok(())
    }

    async fn commit(&self, tx: &TransactionHandle) -> TransportResult<()> {
        let delay = self.faults.lock().await.commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self.take_fault(|f| &mut f.commit).await;
        let mut state = self.state.lock().await;
        Self::ensure_transaction(&state, tx)?;
        Self::finish_transaction(&mut state, tx);
        fault?;
        state.commits += 1;
        Ok(())
    }

    async fn abort(&self, tx: &TransactionHandle) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        Self::finish_transaction(&mut state, tx);
        Ok(())
    }

    async fn remove_record(&self, session: &SessionHandle, fingerprint: &str) -> TransportResult<()> {
        if self.faults.lock().await.fail_compensation {
            return Err(TransportError::Rejected("record removal refused".to_string()));
        }
        let mut state = self.state.lock().await;
        Self::ensure_session(&state, &session.id)?;
        state.records.remove(fingerprint);
        for members in state.playlists.values_mut() {
            members.retain(|m| m != fingerprint);
        }
        Ok(())
    }

    async fn remove_file(&self, session: &SessionHandle, locator: &str) -> TransportResult<()> {
        if self.faults.lock().await.fail_compensation {
            return Err(TransportError::Rejected("file removal refused".to_string()));
        }
        let mut state = self.state.lock().await;
        Self::ensure_session(&state, &session.id)?;
        state.files.remove(locator);
        Ok(())
    }

    async fn fetch_playlist(
        &self,
        session: &SessionHandle,
        name: &str,
    ) -> TransportResult<Option<DevicePlaylist>> {
        let state = self.state.lock().await;
        Self::ensure_session(&state, &session.id)?;
        Ok(state.playlists.get(name).map(|members| DevicePlaylist {
            name: name.to_string(),
            members: members.clone(),
        }))
    }
}

/// Map-backed secure store.
#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        if *self.fail_writes.lock().await {
            return Err(BridgeError::OperationFailed("secure store is read-only".to_string()));
        }
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MediaKind, RecordMetadata};

    fn material(device_id: &str) -> PairingMaterial {
        PairingMaterial {
            device_id: device_id.to_string(),
            host_id: "host".to_string(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn record(fingerprint: &str) -> MediaRecord {
        MediaRecord {
            fingerprint: fingerprint.to_string(),
            kind: MediaKind::Song,
            metadata: RecordMetadata {
                title: "Track".to_string(),
                ..Default::default()
            },
            locator: format!("Media/Music/{}.wav", fingerprint),
            duration_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_applied_steps() {
        let device = MemoryDevice::new("D1");
        let session = device.open_session(&material("D1")).await.unwrap();
        device
            .fail_next_commits(1, TransportError::Busy("db locked".into()))
            .await;

        let tx = device.begin_write(&session).await.unwrap();
        device.write_record(&tx, &record("aa")).await.unwrap();
        let err = device.commit(&tx).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(device.record_count().await, 1);

        device.remove_record(&session, "aa").await.unwrap();
        assert_eq!(device.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_foreign_credential() {
        let device = MemoryDevice::new("D1");
        let err = device.open_session(&material("D2")).await.unwrap_err();
        assert!(matches!(err, TransportError::TrustRejected(_)));
    }

    #[tokio::test]
    async fn test_memory_secure_store_write_failure() {
        let store = MemorySecureStore::new();
        store.set_secret("k", b"v").await.unwrap();

        store.fail_writes(true).await;
        assert!(store.set_secret("k", b"w").await.is_err());
        assert_eq!(store.get_secret("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.list_keys().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_session_reports_closed() {
        let device = MemoryDevice::new("D1");
        let session = device.open_session(&material("D1")).await.unwrap();
        device.drop_sessions().await;

        assert_eq!(
            device.probe(&session).await.unwrap_err(),
            TransportError::SessionClosed
        );
    }
}
