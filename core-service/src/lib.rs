//! Core service façade and bootstrap.
//!
//! This crate wires a [`CoreConfig`] (host-provided device transport, secure
//! store and optional HTTP client) into the pairing, conversion, metadata and
//! injection modules, and exposes the surface the UI layer consumes:
//!
//! - session state and status text, as snapshots and events
//! - credential import
//! - job submission and per-job observation
//! - playlist reconciliation
//!
//! Desktop hosts typically enable the `desktop-shims` feature, which supplies
//! a file-backed secure store and a `reqwest` HTTP client when none is given.

pub mod error;

pub use error::{CoreError, Result};

use core_injection::{
    InjectionRequest, JobHandle, JobOutcome, JobUpdate, MediaInjectionPipeline,
    PlaylistDefinition, PlaylistSynchronizer, ReconcileReport,
};
use core_media::FormatConverter;
use core_metadata::MetadataResolver;
use core_pairing::{
    HeartbeatMonitor, PairingCredential, PairingSessionManager, SessionSnapshot, SessionState,
};
use core_runtime::config::CoreConfig;
use core_runtime::error::Error as RuntimeError;
use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::init_logging;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Primary façade exposed to host applications.
pub struct CoreService {
    event_bus: EventBus,
    manager: Arc<PairingSessionManager>,
    heartbeat: Arc<HeartbeatMonitor>,
    resolver: Arc<MetadataResolver>,
    pipeline: Arc<MediaInjectionPipeline>,
    synchronizer: Arc<PlaylistSynchronizer>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreService {
    /// Build every module from a validated configuration.
    ///
    /// Installs the global tracing subscriber when the config carries a
    /// [`LoggingConfig`](core_runtime::logging::LoggingConfig); one the host
    /// installed earlier is kept. Nothing runs until [`start`](Self::start)
    /// is called.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        if let Some(logging) = config.logging.clone() {
            match init_logging(logging) {
                Ok(()) => {}
                Err(RuntimeError::Logging(reason)) => {
                    warn!(%reason, "Tracing subscriber already installed; keeping the host's");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let event_bus = EventBus::new(config.event_buffer_size);
        let manager = Arc::new(PairingSessionManager::new(
            Arc::clone(&config.secure_store),
            Arc::clone(&config.device_transport),
            event_bus.clone(),
            Arc::clone(&config.clock),
            config.session.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(Arc::clone(&manager)));
        let converter = Arc::new(FormatConverter::new(config.injection.ringtone_max_duration));
        let resolver = Arc::new(MetadataResolver::from_config(
            config.http_client.clone(),
            &config.metadata_api_config,
            Arc::clone(&config.clock),
        ));
        let pipeline = Arc::new(MediaInjectionPipeline::new(
            Arc::clone(&manager),
            converter,
            Arc::clone(&resolver),
            event_bus.clone(),
            &config.injection,
        ));
        let synchronizer = Arc::new(PlaylistSynchronizer::new(
            Arc::clone(&manager),
            Arc::clone(&pipeline),
            event_bus.clone(),
        ));

        Ok(Self {
            event_bus,
            manager,
            heartbeat,
            resolver,
            pipeline,
            synchronizer,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Restore the stored credential, start supervision and try to connect.
    ///
    /// An unreachable device is not an error here; the session stays
    /// `Disconnected` until [`open_session`](Self::open_session) succeeds.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return Err(CoreError::InitializationFailed(
                "core service already started".to_string(),
            ));
        }

        background.push(self.heartbeat.start());
        background.push(self.synchronizer.start());

        if let Some(credential) = self.manager.load_stored_credential().await? {
            info!(device_id = credential.device_id(), "Restored pairing credential");
            if let Err(e) = self.manager.open_session().await {
                warn!(error = %e, "Could not open session at startup");
            }
        }
        Ok(())
    }

    /// Stop background tasks and cancel jobs still waiting for the device.
    pub async fn shutdown(&self) {
        self.synchronizer.shutdown();
        self.heartbeat.shutdown();
        self.pipeline.shutdown().await;
        if let Err(e) = self.manager.close_session("core shutting down").await {
            warn!(error = %e, "Session close during shutdown failed");
        }
        for task in self.background.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Core service stopped");
    }

    // ---- pairing & session ----

    pub async fn import_credential(&self, bytes: &[u8]) -> Result<PairingCredential> {
        Ok(self.manager.import_credential(bytes).await?)
    }

    pub async fn forget_credential(&self) -> Result<()> {
        Ok(self.manager.forget_credential().await?)
    }

    pub async fn open_session(&self) -> Result<()> {
        self.manager.open_session().await?;
        Ok(())
    }

    pub async fn close_session(&self) -> Result<()> {
        Ok(self.manager.close_session("closed by user").await?)
    }

    pub fn session_state(&self) -> SessionState {
        self.manager.current_state()
    }

    /// Current state plus the last human-readable status line.
    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.manager.snapshot()
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.manager.subscribe()
    }

    // ---- injection ----

    pub async fn submit_job(&self, request: InjectionRequest) -> JobHandle {
        self.pipeline.submit(request).await
    }

    /// Status transitions of one job, ending at `Done` or `Failed`.
    pub async fn observe(&self, handle: &JobHandle) -> Result<BoxStream<'static, JobUpdate>> {
        Ok(self.pipeline.observe(handle).await?)
    }

    pub async fn wait(&self, handle: &JobHandle) -> Result<JobOutcome> {
        Ok(self.pipeline.wait(handle).await?)
    }

    pub async fn acknowledge(&self, handle: &JobHandle) -> Result<JobOutcome> {
        Ok(self.pipeline.acknowledge(handle).await?)
    }

    // ---- playlists ----

    pub async fn reconcile_playlist(&self, definition: PlaylistDefinition) -> Result<ReconcileReport> {
        Ok(self.synchronizer.reconcile(definition).await?)
    }

    // ---- observation ----

    /// Stream of every core event emitted after this call.
    pub fn events(&self) -> EventStream {
        self.event_bus.stream()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn metadata_providers(&self) -> Vec<&str> {
        self.resolver.provider_ids()
    }

    pub fn pipeline(&self) -> &Arc<MediaInjectionPipeline> {
        &self.pipeline
    }

    pub fn session_manager(&self) -> &Arc<PairingSessionManager> {
        &self.manager
    }
}
