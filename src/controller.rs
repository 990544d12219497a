//! Container controller
//!
//! One long-lived actor per container record. Owns the Docker lifecycle, RPC
//! authentication, the console registry, and parallel bash tasks. All state
//! transitions are driven by messages: external calls/casts, internal timers,
//! and monitor notifications.

mod actor;
pub mod backoff;

use crate::bus::{CommandKind, CommandStatus, ContainerStatus, EventBus};
use crate::config::Config;
use crate::docker::{DockerAdapter, RpcEndpoint};
use crate::ports::PortAllocator;
use crate::rpc::MsfRpc;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// External container row the controller is bound to; read-only to the core.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub workspace_slug: String,
    pub slug: String,
    pub name: String,
    pub docker_image: String,
}

/// Typed rejection reasons for command submission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("container is not running")]
    ContainerNotRunning,
    #[error("console is not registered for this track")]
    ConsoleNotRegistered,
    #[error("console is offline")]
    ConsoleOffline,
    #[error("console is starting")]
    ConsoleStarting,
    #[error("console is busy")]
    ConsoleBusy,
    #[error("console write failed")]
    ConsoleWriteFailed,
    #[error("controller is gone")]
    ControllerGone,
}

/// A container-scoped command as tracked by the controller.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub text: String,
    pub output: String,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub prompt: Option<String>,
    pub error: Option<String>,
}

/// Fresh endpoint + token pair for callers that talk RPC directly.
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub endpoint: RpcEndpoint,
    pub token: String,
}

/// One in-flight bash exec tracked by the controller.
pub(crate) struct BashInvocation {
    pub track_id: i64,
    pub command: Command,
}

/// Observable controller state, for status queries and tests.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub status: ContainerStatus,
    pub docker_container_id: Option<String>,
    pub rpc_endpoint: Option<RpcEndpoint>,
    pub rpc_port: Option<u16>,
    pub has_auth_token: bool,
    pub restart_count: u32,
    pub msgrpc_connect_attempts: u32,
    pub registered_tracks: BTreeSet<i64>,
    pub console_tracks: BTreeSet<i64>,
    pub running_bash: Vec<Command>,
}

pub(crate) enum ControllerMsg {
    // Calls
    GetStatus {
        reply: oneshot::Sender<ContainerStatus>,
    },
    GetSnapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
    RegisterConsole {
        track_id: i64,
        reply: oneshot::Sender<()>,
    },
    UnregisterConsole {
        track_id: i64,
        reply: oneshot::Sender<()>,
    },
    SendMsfCommand {
        track_id: i64,
        text: String,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    SendBashCommand {
        track_id: i64,
        text: String,
        reply: oneshot::Sender<Result<String, CommandError>>,
    },
    GetRunningBash {
        reply: oneshot::Sender<Vec<Command>>,
    },
    GetRpcEndpoint {
        reply: oneshot::Sender<Option<RpcEndpoint>>,
    },
    GetRpcContext {
        reply: oneshot::Sender<Result<RpcContext, CommandError>>,
    },
    // Casts
    AdoptDockerContainer {
        docker_id: String,
    },
    StartNew,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    // Internal: timers and monitors
    StartContainer,
    ConnectMsgrpc,
    HealthCheck,
    RestartConsole {
        track_id: i64,
    },
    ConsoleDown {
        track_id: i64,
        epoch: u64,
    },
    BashOutput {
        command_id: String,
        output: String,
    },
    BashFinished {
        command_id: String,
        exit_code: i32,
    },
    BashError {
        command_id: String,
        reason: String,
    },
    BashTaskDown {
        command_id: String,
    },
}

/// Everything a controller needs besides its record.
#[derive(Clone)]
pub struct ControllerDeps {
    pub docker: Arc<dyn DockerAdapter>,
    pub rpc: Arc<dyn MsfRpc>,
    pub bus: EventBus,
    pub ports: PortAllocator,
    pub config: Arc<Config>,
}

/// Cheap-to-clone handle to one controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMsg>,
}

impl ControllerHandle {
    /// Spawn the controller actor for a record under supervision: a panic
    /// restarts the actor with exponential backoff, the handle stays valid.
    /// The actor immediately begins its offline -> starting transition.
    pub fn spawn(record: ContainerRecord, deps: ControllerDeps) -> Self {
        use futures::FutureExt;

        let (tx, rx) = mpsc::channel(64);
        let handle = Self { tx: tx.clone() };
        let base = deps.config.base_backoff;
        let max = deps.config.max_backoff;
        crate::supervisor::supervise(
            format!("controller-{}", record.id),
            base,
            max,
            rx,
            move |inner_rx| actor::run(record.clone(), deps.clone(), tx.clone(), inner_rx).boxed(),
        );
        handle
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerMsg,
    ) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn status(&self) -> Option<ContainerStatus> {
        self.call(|reply| ControllerMsg::GetStatus { reply }).await
    }

    pub async fn snapshot(&self) -> Option<ControllerSnapshot> {
        self.call(|reply| ControllerMsg::GetSnapshot { reply }).await
    }

    /// Idempotent; always succeeds while the controller is alive.
    pub async fn register_console(&self, track_id: i64) -> bool {
        self.call(|reply| ControllerMsg::RegisterConsole { track_id, reply })
            .await
            .is_some()
    }

    pub async fn unregister_console(&self, track_id: i64) {
        let _ = self
            .call(|reply| ControllerMsg::UnregisterConsole { track_id, reply })
            .await;
    }

    pub async fn send_metasploit_command(
        &self,
        track_id: i64,
        text: impl Into<String>,
    ) -> Result<String, CommandError> {
        self.call(|reply| ControllerMsg::SendMsfCommand {
            track_id,
            text: text.into(),
            reply,
        })
        .await
        .unwrap_or(Err(CommandError::ControllerGone))
    }

    pub async fn send_bash_command(
        &self,
        track_id: i64,
        text: impl Into<String>,
    ) -> Result<String, CommandError> {
        self.call(|reply| ControllerMsg::SendBashCommand {
            track_id,
            text: text.into(),
            reply,
        })
        .await
        .unwrap_or(Err(CommandError::ControllerGone))
    }

    pub async fn running_bash_commands(&self) -> Vec<Command> {
        self.call(|reply| ControllerMsg::GetRunningBash { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn rpc_endpoint(&self) -> Option<RpcEndpoint> {
        self.call(|reply| ControllerMsg::GetRpcEndpoint { reply })
            .await
            .flatten()
    }

    /// Refreshes the auth token before returning the context.
    pub async fn rpc_context(&self) -> Result<RpcContext, CommandError> {
        self.call(|reply| ControllerMsg::GetRpcContext { reply })
            .await
            .unwrap_or(Err(CommandError::ControllerGone))
    }

    /// Only effective while offline.
    pub async fn adopt_docker_container(&self, docker_id: impl Into<String>) {
        let _ = self
            .tx
            .send(ControllerMsg::AdoptDockerContainer {
                docker_id: docker_id.into(),
            })
            .await;
    }

    /// Only effective while offline; resumes attempts after a give-up.
    pub async fn start_new(&self) {
        let _ = self.tx.send(ControllerMsg::StartNew).await;
    }

    /// Orderly teardown: consoles offlined, bash commands errored, container
    /// stopped.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| ControllerMsg::Shutdown { reply }).await;
    }
}
