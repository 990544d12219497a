//! Workspace orchestration
//!
//! Registry of controllers (by container record id) and track engines (by
//! track id). The controller never knows about tracks beyond their opaque
//! ids; tracks reach their controller through async commands only, and events
//! flow back over the bus.

use chrono::Utc;
use crate::bus::{Event, EventBus, WorkspaceChanged};
use crate::config::Config;
use crate::controller::{ContainerRecord, ControllerDeps, ControllerHandle};
use crate::db::Database;
use crate::docker::DockerAdapter;
use crate::llm::ModelRegistry;
use crate::ports::PortAllocator;
use crate::rpc::MsfRpc;
use crate::track::{TrackError, TrackHandle, TrackManager, TrackMeta};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct Orchestrator {
    config: Arc<Config>,
    bus: EventBus,
    docker: Arc<dyn DockerAdapter>,
    rpc: Arc<dyn MsfRpc>,
    ports: PortAllocator,
    tracks: TrackManager,
    controllers: RwLock<HashMap<i64, ControllerHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        bus: EventBus,
        docker: Arc<dyn DockerAdapter>,
        rpc: Arc<dyn MsfRpc>,
        llm: Arc<ModelRegistry>,
    ) -> Self {
        let ports = PortAllocator::new(config.rpc_port_range.clone());
        let tracks = TrackManager::new(db, bus.clone(), llm, config.clone());
        Self {
            config,
            bus,
            docker,
            rpc,
            ports,
            tracks,
            controllers: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// One controller per container record; spawned on first use.
    pub async fn ensure_controller(&self, record: &ContainerRecord) -> ControllerHandle {
        {
            let controllers = self.controllers.read().await;
            if let Some(handle) = controllers.get(&record.id) {
                return handle.clone();
            }
        }

        let mut controllers = self.controllers.write().await;
        if let Some(handle) = controllers.get(&record.id) {
            return handle.clone();
        }
        let deps = ControllerDeps {
            docker: self.docker.clone(),
            rpc: self.rpc.clone(),
            bus: self.bus.clone(),
            ports: self.ports.clone(),
            config: self.config.clone(),
        };
        let handle = ControllerHandle::spawn(record.clone(), deps);
        controllers.insert(record.id, handle.clone());
        handle
    }

    /// Boot-time sweep: containers that survived a process restart are
    /// adopted by their controllers instead of being started fresh.
    pub async fn adopt_running_containers(&self, records: &[ContainerRecord]) {
        let managed = match self.docker.list_managed().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "managed container sweep failed");
                return;
            }
        };
        for container in managed {
            let Some(record) = records.iter().find(|r| r.id == container.record_id) else {
                tracing::debug!(
                    docker_id = %container.docker_id,
                    record_id = container.record_id,
                    "labelled container without a record, ignoring"
                );
                continue;
            };
            let handle = self.ensure_controller(record).await;
            handle.adopt_docker_container(container.docker_id).await;
        }
    }

    /// Start (or fetch) the engine for a track on a container.
    pub async fn start_track(
        &self,
        record: &ContainerRecord,
        track_id: i64,
    ) -> Result<TrackHandle, TrackError> {
        let controller = self.ensure_controller(record).await;
        let meta = TrackMeta {
            workspace_id: record.workspace_id,
            container_id: record.id,
            track_id,
        };
        let handle = self.tracks.get_or_create(meta, &controller).await?;
        self.notify_workspace(record.workspace_id);
        Ok(handle)
    }

    pub async fn track(&self, track_id: i64) -> Option<TrackHandle> {
        self.tracks.get(track_id).await
    }

    /// Archive a track: its engine stops and its console intent is dropped.
    /// The controller survives while any track remains registered.
    pub async fn archive_track(&self, record: &ContainerRecord, track_id: i64) {
        let controller = self.ensure_controller(record).await;
        self.tracks.remove(track_id, &controller).await;

        let no_tracks_left = controller
            .snapshot()
            .await
            .map(|snap| snap.registered_tracks.is_empty())
            .unwrap_or(true);
        if no_tracks_left {
            tracing::info!(container_id = record.id, "last track archived, stopping controller");
            controller.shutdown().await;
            self.controllers.write().await.remove(&record.id);
        }
        self.notify_workspace(record.workspace_id);
    }

    fn notify_workspace(&self, workspace_id: i64) {
        self.bus.broadcast(Event::WorkspaceChanged(WorkspaceChanged {
            workspace_id,
            ts: Utc::now(),
        }));
    }

    /// Orderly teardown of every track and controller.
    pub async fn shutdown(&self) {
        self.tracks.shutdown_all().await;
        let handles: Vec<ControllerHandle> = {
            let mut controllers = self.controllers.write().await;
            controllers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
