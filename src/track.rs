//! Track engine shell
//!
//! One runtime per track, owning the pure engine state and all persistence
//! of chat and console-history rows. The manager keeps the registry of live
//! tracks keyed by the opaque track id.

mod executor;
#[cfg(test)]
pub mod testing;
pub mod traits;

use crate::bus::{ConsoleStatus, EventBus};
use crate::config::Config;
use crate::controller::{CommandError, ControllerHandle};
use crate::db::{Database, ToolStatus, TurnStatus};
use crate::engine::{EngineError, TrackState};
use crate::llm::ModelRegistry;
use executor::{TrackMsg, TrackRuntime};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use traits::{CommandRouter, ControllerRouter, RegistryLauncher, StreamLauncher, TrackStore};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("no turn was created")]
    NoTurn,
    #[error("no model is available")]
    NoModel,
    #[error("track engine is gone")]
    TrackGone,
}

/// Identity of one track within its workspace/container.
#[derive(Debug, Clone, Copy)]
pub struct TrackMeta {
    pub workspace_id: i64,
    pub container_id: i64,
    pub track_id: i64,
}

/// Observable track state, for status queries and tests.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub console_status: ConsoleStatus,
    pub prompt: String,
    pub history_blocks: usize,
    pub turn_status: TurnStatus,
    pub turn_id: Option<i64>,
    pub autonomous: bool,
    pub tools: Vec<(i64, ToolStatus)>,
}

/// Cheap-to-clone handle to one track engine.
#[derive(Clone)]
pub struct TrackHandle {
    tx: mpsc::Sender<TrackMsg>,
}

impl TrackHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> TrackMsg) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    /// Submit an AI prompt; returns the new turn id.
    pub async fn start_chat_turn(
        &self,
        text: impl Into<String>,
        model: Option<String>,
    ) -> Result<i64, TrackError> {
        self.call(|reply| TrackMsg::StartChatTurn {
            text: text.into(),
            model,
            reply,
        })
        .await
        .unwrap_or(Err(TrackError::TrackGone))
    }

    pub async fn approve_tool(&self, entry_id: i64) -> Result<(), TrackError> {
        self.call(|reply| TrackMsg::ApproveTool { entry_id, reply })
            .await
            .unwrap_or(Err(TrackError::TrackGone))
    }

    pub async fn deny_tool(
        &self,
        entry_id: i64,
        reason: impl Into<String>,
    ) -> Result<(), TrackError> {
        self.call(|reply| TrackMsg::DenyTool {
            entry_id,
            reason: reason.into(),
            reply,
        })
        .await
        .unwrap_or(Err(TrackError::TrackGone))
    }

    pub async fn cancel_turn(&self) {
        let _ = self.call(|reply| TrackMsg::CancelTurn { reply }).await;
    }

    pub async fn set_autonomous(&self, value: bool) {
        let _ = self
            .call(|reply| TrackMsg::SetAutonomous { value, reply })
            .await;
    }

    /// Manual console command, routed through the controller.
    pub async fn send_console_command(
        &self,
        text: impl Into<String>,
    ) -> Result<String, CommandError> {
        self.call(|reply| TrackMsg::SendConsoleCommand {
            text: text.into(),
            reply,
        })
        .await
        .unwrap_or(Err(CommandError::ControllerGone))
    }

    pub async fn snapshot(&self) -> Option<TrackSnapshot> {
        self.call(|reply| TrackMsg::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.call(|reply| TrackMsg::Shutdown { reply }).await;
    }
}

/// Spawn a track runtime with explicit adapters (tests inject mocks here).
/// The runtime is supervised: a panic restarts it with a fresh state seeded
/// from the store, the handle stays valid.
pub fn spawn_track<S, R, L>(
    meta: TrackMeta,
    store: S,
    router: R,
    launcher: L,
    config: Arc<Config>,
    bus: EventBus,
    default_model: String,
) -> TrackHandle
where
    S: TrackStore + Clone + 'static,
    R: CommandRouter + Clone + 'static,
    L: StreamLauncher + Clone + 'static,
{
    use futures::FutureExt;

    let (tx, rx) = mpsc::channel(64);
    let (llm_tx, mut llm_rx) = mpsc::channel(256);

    // LLM pump: stream events enter the same inbox as everything else.
    let llm_pump_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(message) = llm_rx.recv().await {
            if llm_pump_tx.send(TrackMsg::Llm(message)).await.is_err() {
                break;
            }
        }
    });

    // Bus pump: the runtime sees every workspace event through its inbox.
    let bus_rx = bus.subscribe(meta.workspace_id);
    let bus_pump_tx = tx.clone();
    tokio::spawn(async move {
        use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt;

        let mut events = BroadcastStream::new(bus_rx);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if bus_pump_tx.send(TrackMsg::Bus(event)).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    // Missed events are not replayed; state is re-queried.
                    tracing::warn!(track_id = meta.track_id, missed, "track lagged on bus");
                }
            }
        }
    });

    let base = config.base_backoff;
    let max = config.max_backoff;
    let outer_tx = tx.clone();
    crate::supervisor::supervise(
        format!("track-{}", meta.track_id),
        base,
        max,
        rx,
        move |inner_rx| {
            let next_position = store.max_position(meta.track_id).unwrap_or(0) + 1;
            let runtime = TrackRuntime::new(
                meta,
                TrackState::new(meta.track_id, next_position),
                store.clone(),
                router.clone(),
                launcher.clone(),
                config.clone(),
                bus.clone(),
                default_model.clone(),
                outer_tx.clone(),
                llm_tx.clone(),
            );
            runtime.run(inner_rx).boxed()
        },
    );

    TrackHandle { tx }
}

/// Registry of live track engines.
pub struct TrackManager {
    db: Database,
    bus: EventBus,
    llm: Arc<ModelRegistry>,
    config: Arc<Config>,
    tracks: RwLock<HashMap<i64, TrackHandle>>,
}

impl TrackManager {
    pub fn new(db: Database, bus: EventBus, llm: Arc<ModelRegistry>, config: Arc<Config>) -> Self {
        Self {
            db,
            bus,
            llm,
            config,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Get or start the engine for a track, registering its console intent
    /// with the container controller.
    pub async fn get_or_create(
        &self,
        meta: TrackMeta,
        controller: &ControllerHandle,
    ) -> Result<TrackHandle, TrackError> {
        let mut tracks = self.tracks.write().await;
        if let Some(handle) = tracks.get(&meta.track_id) {
            return Ok(handle.clone());
        }

        let default_model = self.llm.default_model().ok_or(TrackError::NoModel)?;

        // The engine subscribes before the console intent is registered so
        // the first console events are not missed.
        let handle = spawn_track(
            meta,
            self.db.clone(),
            ControllerRouter::new(controller.clone()),
            RegistryLauncher::new(self.llm.clone()),
            self.config.clone(),
            self.bus.clone(),
            default_model,
        );
        controller.register_console(meta.track_id).await;

        tracks.insert(meta.track_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, track_id: i64) -> Option<TrackHandle> {
        self.tracks.read().await.get(&track_id).cloned()
    }

    /// Stop a track engine and drop its console registration.
    pub async fn remove(&self, track_id: i64, controller: &ControllerHandle) {
        if let Some(handle) = self.tracks.write().await.remove(&track_id) {
            handle.shutdown().await;
        }
        controller.unregister_console(track_id).await;
    }

    pub async fn shutdown_all(&self) {
        let handles: Vec<TrackHandle> = self.tracks.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
