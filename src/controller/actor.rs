//! Controller actor loop and state machine
//!
//! ```text
//!         (init) --> offline --start_container--> starting --msgrpc_auth--> running
//!                     ^   ^                        |                         |
//!                     |   +---docker/rpc fail------+                         |
//!                     +------------- docker dies / health check fails -------+
//! ```
//!
//! Offline is a resumable resting state with full retry semantics; transient
//! errors retry in place, persistent errors fall back to offline + scheduled
//! retry, unexpected errors crash under supervision.

use super::backoff;
use super::{
    BashInvocation, Command, CommandError, ContainerRecord, ControllerDeps, ControllerMsg,
    ControllerSnapshot, RpcContext,
};
use crate::bus::{
    CommandIssued, CommandKind, CommandResult, CommandStatus, ConsoleStatus, ConsoleUpdated,
    ContainerStatus, ContainerUpdated, Event,
};
use crate::console::{self, ConsoleHandle as SessionHandle, ConsoleMeta, ConsoleOpts, SendError};
use crate::docker::{container_name, ContainerLabels};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const MAX_BASH_OUTPUT: usize = 128 * 1024;
const BASH_SNIP: usize = 4 * 1024;

struct ConsoleSlot {
    handle: Option<SessionHandle>,
    epoch: u64,
    restart_attempts: u32,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Controller {
    record: ContainerRecord,
    deps: ControllerDeps,
    tx: mpsc::Sender<ControllerMsg>,
    status: ContainerStatus,
    docker_container_id: Option<String>,
    rpc_endpoint: Option<crate::docker::RpcEndpoint>,
    rpc_port: Option<u16>,
    auth_token: Option<String>,
    restart_count: u32,
    msgrpc_connect_attempts: u32,
    running_since: Option<Instant>,
    registered_tracks: BTreeSet<i64>,
    consoles: HashMap<i64, ConsoleSlot>,
    running_bash: HashMap<String, BashInvocation>,
    gave_up: bool,
    console_epoch: u64,
}

pub(super) async fn run(
    record: ContainerRecord,
    deps: ControllerDeps,
    tx: mpsc::Sender<ControllerMsg>,
    mut rx: mpsc::Receiver<ControllerMsg>,
) {
    let health_interval = deps.config.health_check_interval;
    let mut ctl = Controller {
        record,
        deps,
        tx: tx.clone(),
        status: ContainerStatus::Offline,
        docker_container_id: None,
        rpc_endpoint: None,
        rpc_port: None,
        auth_token: None,
        restart_count: 0,
        msgrpc_connect_attempts: 0,
        running_since: None,
        registered_tracks: BTreeSet::new(),
        consoles: HashMap::new(),
        running_bash: HashMap::new(),
        gave_up: false,
        console_epoch: 0,
    };

    tracing::info!(
        container_id = ctl.record.id,
        name = %ctl.record.name,
        "controller starting"
    );
    ctl.broadcast_container();

    let health_task = {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if tx.send(ControllerMsg::HealthCheck).await.is_err() {
                    break;
                }
            }
        })
    };

    ctl.handle_start_container().await;

    while let Some(msg) = rx.recv().await {
        if ctl.handle(msg).await == Flow::Stop {
            break;
        }
    }

    health_task.abort();
    tracing::info!(container_id = ctl.record.id, "controller stopped");
}

impl Controller {
    async fn handle(&mut self, msg: ControllerMsg) -> Flow {
        match msg {
            ControllerMsg::GetStatus { reply } => {
                let _ = reply.send(self.status);
            }
            ControllerMsg::GetSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControllerMsg::RegisterConsole { track_id, reply } => {
                self.handle_register(track_id).await;
                let _ = reply.send(());
            }
            ControllerMsg::UnregisterConsole { track_id, reply } => {
                self.handle_unregister(track_id).await;
                let _ = reply.send(());
            }
            ControllerMsg::SendMsfCommand {
                track_id,
                text,
                reply,
            } => {
                let result = self.handle_send_msf(track_id, text).await;
                let _ = reply.send(result);
            }
            ControllerMsg::SendBashCommand {
                track_id,
                text,
                reply,
            } => {
                let result = self.handle_send_bash(track_id, text);
                let _ = reply.send(result);
            }
            ControllerMsg::GetRunningBash { reply } => {
                let _ = reply.send(
                    self.running_bash
                        .values()
                        .map(|inv| inv.command.clone())
                        .collect(),
                );
            }
            ControllerMsg::GetRpcEndpoint { reply } => {
                let _ = reply.send(self.rpc_endpoint.clone());
            }
            ControllerMsg::GetRpcContext { reply } => {
                let result = self.handle_rpc_context().await;
                let _ = reply.send(result);
            }
            ControllerMsg::AdoptDockerContainer { docker_id } => {
                if self.status == ContainerStatus::Offline {
                    self.docker_container_id = Some(docker_id);
                    self.gave_up = false;
                    self.restart_count = 0;
                    self.handle_start_container().await;
                }
            }
            ControllerMsg::StartNew => {
                if self.status == ContainerStatus::Offline {
                    self.docker_container_id = None;
                    self.gave_up = false;
                    self.restart_count = 0;
                    self.handle_start_container().await;
                }
            }
            ControllerMsg::Shutdown { reply } => {
                self.handle_shutdown().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
            ControllerMsg::StartContainer => self.handle_start_container().await,
            ControllerMsg::ConnectMsgrpc => self.handle_connect_msgrpc().await,
            ControllerMsg::HealthCheck => self.handle_health_check().await,
            ControllerMsg::RestartConsole { track_id } => {
                // Skipped when the track left or the container fell over so
                // that consoles stay a subset of registered tracks.
                if self.status == ContainerStatus::Running
                    && self.registered_tracks.contains(&track_id)
                {
                    self.spawn_console(track_id).await;
                }
            }
            ControllerMsg::ConsoleDown { track_id, epoch } => {
                self.handle_console_down(track_id, epoch);
            }
            ControllerMsg::BashOutput { command_id, output } => {
                self.handle_bash_output(&command_id, output);
            }
            ControllerMsg::BashFinished {
                command_id,
                exit_code,
            } => {
                self.handle_bash_finished(&command_id, exit_code);
            }
            ControllerMsg::BashError { command_id, reason } => {
                self.handle_bash_error(&command_id, reason);
            }
            ControllerMsg::BashTaskDown { command_id } => {
                if self.running_bash.contains_key(&command_id) {
                    // Terminal message never arrived: the exec task died.
                    self.handle_bash_error(&command_id, "bash task died".to_string());
                }
            }
        }
        Flow::Continue
    }

    // ---- container lifecycle ----

    async fn handle_start_container(&mut self) {
        if self.status != ContainerStatus::Offline || self.gave_up {
            return;
        }
        self.status = ContainerStatus::Starting;
        self.broadcast_container();

        // Adoption first: a surviving container with our label is reused.
        if let Some(docker_id) = self.docker_container_id.clone() {
            match self.deps.docker.container_running(&docker_id).await {
                Ok(true) => match self.deps.docker.rpc_endpoint(&docker_id).await {
                    Ok(endpoint) => {
                        tracing::info!(
                            container_id = self.record.id,
                            docker_id = %docker_id,
                            "adopted running container"
                        );
                        self.rpc_endpoint = Some(endpoint);
                        self.msgrpc_connect_attempts = 0;
                        self.schedule(
                            ControllerMsg::ConnectMsgrpc,
                            self.deps.config.msgrpc_initial_delay,
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            container_id = self.record.id,
                            error = %e,
                            "adoption failed to resolve endpoint, starting fresh"
                        );
                        self.docker_container_id = None;
                    }
                },
                _ => {
                    self.docker_container_id = None;
                }
            }
        }

        // Start new.
        let port = match self.deps.ports.allocate() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(container_id = self.record.id, error = %e, "port allocation failed");
                self.start_failed();
                return;
            }
        };
        self.rpc_port = Some(port);

        let name = container_name(&self.record.workspace_slug, &self.record.slug);
        let labels = ContainerLabels {
            record_id: self.record.id,
            workspace_slug: self.record.workspace_slug.clone(),
            container_slug: self.record.slug.clone(),
        };

        let docker_id = match self.deps.docker.start_container(&name, &labels, port).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(container_id = self.record.id, error = %e, "container start failed");
                self.start_failed();
                return;
            }
        };

        match self.deps.docker.rpc_endpoint(&docker_id).await {
            Ok(endpoint) => {
                self.docker_container_id = Some(docker_id);
                self.rpc_endpoint = Some(endpoint);
                self.msgrpc_connect_attempts = 0;
                self.schedule(
                    ControllerMsg::ConnectMsgrpc,
                    self.deps.config.msgrpc_initial_delay,
                );
            }
            Err(e) => {
                tracing::warn!(container_id = self.record.id, error = %e, "endpoint resolution failed");
                let _ = self.deps.docker.stop_container(&docker_id).await;
                self.start_failed();
            }
        }
    }

    fn start_failed(&mut self) {
        self.release_port();
        self.rpc_endpoint = None;
        self.docker_container_id = None;
        self.status = ContainerStatus::Offline;
        self.broadcast_container();
        self.restart_count += 1;
        self.schedule_restart_or_give_up();
    }

    fn schedule_restart_or_give_up(&mut self) {
        if self.restart_count >= self.deps.config.max_restart_count {
            tracing::error!(
                container_id = self.record.id,
                restart_count = self.restart_count,
                "giving up on container restarts until an external start"
            );
            self.gave_up = true;
            return;
        }
        let delay = backoff::exponential(
            self.deps.config.base_backoff,
            self.deps.config.max_backoff,
            self.restart_count,
        );
        tracing::info!(
            container_id = self.record.id,
            restart_count = self.restart_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling container restart"
        );
        self.schedule(ControllerMsg::StartContainer, delay);
    }

    async fn handle_connect_msgrpc(&mut self) {
        if self.status != ContainerStatus::Starting {
            return;
        }
        let Some(endpoint) = self.rpc_endpoint.clone() else {
            return;
        };

        match self.deps.rpc.login(&endpoint).await {
            Ok(token) => {
                self.auth_token = Some(token);
                self.msgrpc_connect_attempts = 0;
                self.status = ContainerStatus::Running;
                self.running_since = Some(Instant::now());
                self.broadcast_container();
                tracing::info!(container_id = self.record.id, "rpc authenticated, running");

                for track_id in self.registered_tracks.clone() {
                    self.spawn_console(track_id).await;
                }
            }
            Err(e) => {
                self.msgrpc_connect_attempts += 1;
                if self.msgrpc_connect_attempts >= self.deps.config.msgrpc_max_connect_attempts {
                    tracing::warn!(
                        container_id = self.record.id,
                        attempts = self.msgrpc_connect_attempts,
                        error = %e,
                        "rpc authentication exhausted, treating as container crash"
                    );
                    self.container_down(true).await;
                } else {
                    let delay = backoff::linear(
                        self.deps.config.msgrpc_connect_base_backoff,
                        self.msgrpc_connect_attempts,
                    );
                    tracing::debug!(
                        container_id = self.record.id,
                        attempts = self.msgrpc_connect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "rpc authentication failed, retrying"
                    );
                    self.schedule(ControllerMsg::ConnectMsgrpc, delay);
                }
            }
        }
    }

    async fn handle_health_check(&mut self) {
        if self.status == ContainerStatus::Offline {
            return;
        }
        let Some(docker_id) = self.docker_container_id.clone() else {
            return;
        };
        match self.deps.docker.container_running(&docker_id).await {
            Ok(true) => {
                if self.status == ContainerStatus::Running {
                    if let Some(since) = self.running_since {
                        if since.elapsed() >= self.deps.config.success_reset
                            && self.restart_count > 0
                        {
                            tracing::info!(
                                container_id = self.record.id,
                                "stable run, resetting restart counter"
                            );
                            self.restart_count = 0;
                        }
                    }
                }
            }
            Ok(false) => {
                tracing::warn!(container_id = self.record.id, "container died");
                self.container_down(false).await;
            }
            Err(e) => {
                // Transient docker API failure: the next tick probes again.
                tracing::debug!(container_id = self.record.id, error = %e, "health probe failed");
            }
        }
    }

    /// Shared crash path for `running -> offline` and exhausted RPC auth.
    async fn container_down(&mut self, stop_container: bool) {
        let mut affected: BTreeSet<i64> = self.registered_tracks.clone();
        affected.extend(self.consoles.keys().copied());
        for track_id in affected {
            self.emit_console_offline(track_id);
        }
        // Dropping the handles closes the session inboxes; the tasks exit on
        // their own and the stale ConsoleDown notifications are ignored.
        self.consoles.clear();
        self.auth_token = None;
        self.rpc_endpoint = None;
        self.running_since = None;

        if stop_container {
            if let Some(docker_id) = self.docker_container_id.clone() {
                let _ = self.deps.docker.stop_container(&docker_id).await;
            }
        }
        self.docker_container_id = None;
        self.release_port();

        self.status = ContainerStatus::Offline;
        self.broadcast_container();
        self.restart_count += 1;
        self.schedule_restart_or_give_up();
    }

    // ---- console registry ----

    async fn handle_register(&mut self, track_id: i64) {
        self.registered_tracks.insert(track_id);
        let has_live_console = self
            .consoles
            .get(&track_id)
            .is_some_and(|slot| slot.handle.is_some());
        if self.status == ContainerStatus::Running && !has_live_console {
            self.spawn_console(track_id).await;
        }
    }

    async fn handle_unregister(&mut self, track_id: i64) {
        self.registered_tracks.remove(&track_id);
        if let Some(slot) = self.consoles.remove(&track_id) {
            if let Some(handle) = slot.handle {
                handle.go_offline().await;
            }
            // Cleanup is uniform: offline is emitted even for a healthy
            // session that was just destroyed.
            self.emit_console_offline(track_id);
        }
    }

    async fn spawn_console(&mut self, track_id: i64) {
        if self.status != ContainerStatus::Running {
            return;
        }
        let Some(endpoint) = self.rpc_endpoint.clone() else {
            return;
        };

        // Fresh token per spawn to avoid expired-token races.
        let token = match self.deps.rpc.login(&endpoint).await {
            Ok(token) => {
                self.auth_token = Some(token.clone());
                token
            }
            Err(e) => {
                tracing::warn!(
                    container_id = self.record.id,
                    track_id,
                    error = %e,
                    "console token refresh failed"
                );
                self.console_spawn_failed(track_id);
                return;
            }
        };

        let opts = ConsoleOpts {
            rpc: self.deps.rpc.clone(),
            endpoint,
            token,
            bus: self.deps.bus.clone(),
            meta: ConsoleMeta {
                workspace_id: self.record.workspace_id,
                container_id: self.record.id,
                track_id,
            },
            poll_interval: self.deps.config.console_poll_interval,
            prompt_terminators: self.deps.config.prompt_terminators.clone(),
        };

        match console::start(opts).await {
            Ok(mut handle) => {
                self.console_epoch += 1;
                let epoch = self.console_epoch;
                let join = handle.join.take();

                let slot = self.consoles.entry(track_id).or_insert(ConsoleSlot {
                    handle: None,
                    epoch,
                    restart_attempts: 0,
                });
                slot.handle = Some(handle);
                slot.epoch = epoch;
                slot.restart_attempts = 0;

                if let Some(join) = join {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let _ = join.await;
                        let _ = tx.send(ControllerMsg::ConsoleDown { track_id, epoch }).await;
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    container_id = self.record.id,
                    track_id,
                    error = %e,
                    "console spawn failed"
                );
                self.console_spawn_failed(track_id);
            }
        }
    }

    fn console_spawn_failed(&mut self, track_id: i64) {
        let slot = self.consoles.entry(track_id).or_insert(ConsoleSlot {
            handle: None,
            epoch: 0,
            restart_attempts: 0,
        });
        slot.handle = None;
        slot.restart_attempts += 1;
        let attempts = slot.restart_attempts;
        if attempts > self.deps.config.console_max_restart_attempts {
            tracing::error!(
                container_id = self.record.id,
                track_id,
                attempts,
                "giving up on console restarts"
            );
            return;
        }
        let delay = backoff::exponential(
            self.deps.config.console_restart_base_backoff,
            self.deps.config.console_restart_max_backoff,
            attempts,
        );
        self.schedule(ControllerMsg::RestartConsole { track_id }, delay);
    }

    fn handle_console_down(&mut self, track_id: i64, epoch: u64) {
        let Some(slot) = self.consoles.get_mut(&track_id) else {
            return;
        };
        if slot.epoch != epoch || slot.handle.is_none() {
            return;
        }
        slot.handle = None;
        tracing::warn!(container_id = self.record.id, track_id, "console session died");
        // The dead session cannot emit its own offline event.
        self.emit_console_offline(track_id);
        self.console_spawn_failed(track_id);
    }

    // ---- commands ----

    async fn handle_send_msf(
        &mut self,
        track_id: i64,
        text: String,
    ) -> Result<String, CommandError> {
        if self.status != ContainerStatus::Running {
            return Err(CommandError::ContainerNotRunning);
        }
        if !self.registered_tracks.contains(&track_id) {
            return Err(CommandError::ConsoleNotRegistered);
        }
        let handle = self
            .consoles
            .get(&track_id)
            .and_then(|slot| slot.handle.as_ref())
            .ok_or(CommandError::ConsoleOffline)?;

        match handle.send_command(text.clone()).await {
            Ok(command_id) => {
                self.deps.bus.broadcast(Event::CommandIssued(CommandIssued {
                    workspace_id: self.record.workspace_id,
                    container_id: self.record.id,
                    track_id,
                    command_id: command_id.clone(),
                    kind: CommandKind::Metasploit,
                    command: text,
                    ts: Utc::now(),
                }));
                Ok(command_id)
            }
            Err(SendError::Starting) => Err(CommandError::ConsoleStarting),
            Err(SendError::Busy) => Err(CommandError::ConsoleBusy),
            // The session dies on a write failure and will be restarted.
            Err(SendError::WriteFailed) => Err(CommandError::ConsoleWriteFailed),
            Err(SendError::Offline) => Err(CommandError::ConsoleOffline),
        }
    }

    fn handle_send_bash(&mut self, track_id: i64, text: String) -> Result<String, CommandError> {
        if self.status != ContainerStatus::Running {
            return Err(CommandError::ContainerNotRunning);
        }
        let Some(docker_id) = self.docker_container_id.clone() else {
            return Err(CommandError::ContainerNotRunning);
        };

        let command_id = uuid::Uuid::new_v4().to_string();
        self.running_bash.insert(
            command_id.clone(),
            BashInvocation {
                track_id,
                command: Command {
                    id: command_id.clone(),
                    kind: CommandKind::Bash,
                    text: text.clone(),
                    output: String::new(),
                    status: CommandStatus::Running,
                    exit_code: None,
                    prompt: None,
                    error: None,
                },
            },
        );

        self.deps.bus.broadcast(Event::CommandIssued(CommandIssued {
            workspace_id: self.record.workspace_id,
            container_id: self.record.id,
            track_id,
            command_id: command_id.clone(),
            kind: CommandKind::Bash,
            command: text.clone(),
            ts: Utc::now(),
        }));

        // Unlinked task; results come back as messages, the monitor cleans up
        // if the task dies without a terminal message.
        let docker = self.deps.docker.clone();
        let tx = self.tx.clone();
        let task_command_id = command_id.clone();
        let exec_task = tokio::spawn(async move {
            match docker.exec(&docker_id, &text).await {
                Ok(out) => {
                    let _ = tx
                        .send(ControllerMsg::BashOutput {
                            command_id: task_command_id.clone(),
                            output: truncate_output(&out.stdout),
                        })
                        .await;
                    let _ = tx
                        .send(ControllerMsg::BashFinished {
                            command_id: task_command_id,
                            exit_code: out.exit_code,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(ControllerMsg::BashError {
                            command_id: task_command_id,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });

        let monitor_tx = self.tx.clone();
        let monitor_command_id = command_id.clone();
        tokio::spawn(async move {
            let _ = exec_task.await;
            let _ = monitor_tx
                .send(ControllerMsg::BashTaskDown {
                    command_id: monitor_command_id,
                })
                .await;
        });

        Ok(command_id)
    }

    fn handle_bash_output(&mut self, command_id: &str, output: String) {
        let Some(inv) = self.running_bash.get_mut(command_id) else {
            return;
        };
        inv.command.output.push_str(&output);
        let result = self.bash_result(command_id, CommandStatus::Running, None, None);
        if let Some(result) = result {
            self.deps.bus.broadcast(Event::CommandResult(result));
        }
    }

    fn handle_bash_finished(&mut self, command_id: &str, exit_code: i32) {
        let result = self.bash_result(command_id, CommandStatus::Finished, Some(exit_code), None);
        self.running_bash.remove(command_id);
        if let Some(result) = result {
            self.deps.bus.broadcast(Event::CommandResult(result));
        }
    }

    fn handle_bash_error(&mut self, command_id: &str, reason: String) {
        let result = self.bash_result(command_id, CommandStatus::Error, None, Some(reason));
        self.running_bash.remove(command_id);
        if let Some(result) = result {
            self.deps.bus.broadcast(Event::CommandResult(result));
        }
    }

    fn bash_result(
        &self,
        command_id: &str,
        status: CommandStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Option<CommandResult> {
        let inv = self.running_bash.get(command_id)?;
        Some(CommandResult {
            workspace_id: self.record.workspace_id,
            container_id: self.record.id,
            track_id: inv.track_id,
            command_id: command_id.to_string(),
            kind: CommandKind::Bash,
            command: inv.command.text.clone(),
            output: inv.command.output.clone(),
            prompt: String::new(),
            status,
            exit_code,
            error,
            ts: Utc::now(),
        })
    }

    async fn handle_rpc_context(&mut self) -> Result<RpcContext, CommandError> {
        let Some(endpoint) = self.rpc_endpoint.clone() else {
            return Err(CommandError::ContainerNotRunning);
        };
        match self.deps.rpc.login(&endpoint).await {
            Ok(token) => {
                self.auth_token = Some(token.clone());
                Ok(RpcContext { endpoint, token })
            }
            Err(e) => {
                tracing::warn!(container_id = self.record.id, error = %e, "rpc context refresh failed");
                Err(CommandError::ContainerNotRunning)
            }
        }
    }

    // ---- teardown ----

    async fn handle_shutdown(&mut self) {
        tracing::info!(container_id = self.record.id, "controller shutting down");

        for (track_id, slot) in std::mem::take(&mut self.consoles) {
            if let Some(handle) = slot.handle {
                handle.go_offline().await;
            }
            self.emit_console_offline(track_id);
        }

        for (command_id, inv) in std::mem::take(&mut self.running_bash) {
            self.deps
                .bus
                .broadcast(Event::CommandResult(CommandResult {
                    workspace_id: self.record.workspace_id,
                    container_id: self.record.id,
                    track_id: inv.track_id,
                    command_id,
                    kind: CommandKind::Bash,
                    command: inv.command.text,
                    output: inv.command.output,
                    prompt: String::new(),
                    status: CommandStatus::Error,
                    exit_code: None,
                    error: Some("container_stopped".to_string()),
                    ts: Utc::now(),
                }));
        }

        if matches!(
            self.status,
            ContainerStatus::Starting | ContainerStatus::Running
        ) {
            if let Some(docker_id) = self.docker_container_id.clone() {
                let _ = self.deps.docker.stop_container(&docker_id).await;
            }
        }
        self.docker_container_id = None;
        self.auth_token = None;
        self.rpc_endpoint = None;
        self.release_port();
        self.status = ContainerStatus::Offline;
        self.broadcast_container();
    }

    // ---- helpers ----

    fn release_port(&mut self) {
        if let Some(port) = self.rpc_port.take() {
            self.deps.ports.release(port);
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            status: self.status,
            docker_container_id: self.docker_container_id.clone(),
            rpc_endpoint: self.rpc_endpoint.clone(),
            rpc_port: self.rpc_port,
            has_auth_token: self.auth_token.is_some(),
            restart_count: self.restart_count,
            msgrpc_connect_attempts: self.msgrpc_connect_attempts,
            registered_tracks: self.registered_tracks.clone(),
            console_tracks: self
                .consoles
                .iter()
                .filter(|(_, slot)| slot.handle.is_some())
                .map(|(track_id, _)| *track_id)
                .collect(),
            running_bash: self
                .running_bash
                .values()
                .map(|inv| inv.command.clone())
                .collect(),
        }
    }

    fn broadcast_container(&self) {
        self.deps
            .bus
            .broadcast(Event::ContainerUpdated(ContainerUpdated {
                workspace_id: self.record.workspace_id,
                container_id: self.record.id,
                slug: self.record.slug.clone(),
                name: self.record.name.clone(),
                image: self.record.docker_image.clone(),
                status: self.status,
                docker_container_id: self.docker_container_id.clone(),
                ts: Utc::now(),
            }));
    }

    fn emit_console_offline(&self, track_id: i64) {
        self.deps.bus.broadcast(Event::ConsoleUpdated(ConsoleUpdated {
            workspace_id: self.record.workspace_id,
            container_id: self.record.id,
            track_id,
            status: ConsoleStatus::Offline,
            command_id: None,
            command: None,
            output: String::new(),
            prompt: String::new(),
            ts: Utc::now(),
        }));
    }

    fn schedule(&self, msg: ControllerMsg, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg).await;
        });
    }
}

/// Cap bash output, keeping the head and tail around a snip marker.
fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_BASH_OUTPUT {
        return output.to_string();
    }
    let head_end = output
        .char_indices()
        .take_while(|(i, _)| *i < BASH_SNIP)
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    let tail_start = output
        .char_indices()
        .find(|(i, _)| *i >= output.len() - BASH_SNIP)
        .map_or(output.len(), |(i, _)| i);
    let head = output.get(..head_end).unwrap_or_default();
    let tail = output.get(tail_start..).unwrap_or_default();
    format!(
        "{head}\n[... {} bytes snipped ...]\n{tail}",
        tail_start - head_end
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::Config;
    use crate::controller::ControllerHandle;
    use crate::docker::{DockerAdapter, DockerError, ExecOutput, ManagedContainer, RpcEndpoint};
    use crate::ports::PortAllocator;
    use crate::rpc::{ConsoleCreated, ConsoleRead, MsfRpc, RpcError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeDocker {
        running: AtomicBool,
        fail_start: AtomicBool,
        started: AtomicU32,
        stopped: AtomicU32,
    }

    impl FakeDocker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                started: AtomicU32::new(0),
                stopped: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DockerAdapter for FakeDocker {
        async fn start_container(
            &self,
            _name: &str,
            _labels: &ContainerLabels,
            _rpc_port: u16,
        ) -> Result<String, DockerError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(DockerError::Command("image missing".to_string()));
            }
            self.running.store(true, Ordering::SeqCst);
            let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("docker-{n}"))
        }

        async fn stop_container(&self, _docker_id: &str) -> Result<(), DockerError> {
            self.running.store(false, Ordering::SeqCst);
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn container_running(&self, _docker_id: &str) -> Result<bool, DockerError> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn rpc_endpoint(&self, _docker_id: &str) -> Result<RpcEndpoint, DockerError> {
            Ok(RpcEndpoint {
                host: "127.0.0.1".to_string(),
                port: 55553,
            })
        }

        async fn exec(&self, _docker_id: &str, command: &str) -> Result<ExecOutput, DockerError> {
            Ok(ExecOutput {
                stdout: format!("ran: {command}\n"),
                exit_code: 0,
            })
        }

        async fn list_managed(&self) -> Result<Vec<ManagedContainer>, DockerError> {
            Ok(vec![])
        }
    }

    /// Console reads cycle: banner+prompt, then forever idle.
    struct FakeRpc {
        fail_login: AtomicBool,
        consoles_created: AtomicU32,
        reads: Mutex<u32>,
    }

    impl FakeRpc {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_login: AtomicBool::new(false),
                consoles_created: AtomicU32::new(0),
                reads: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl MsfRpc for FakeRpc {
        async fn login(&self, _endpoint: &RpcEndpoint) -> Result<String, RpcError> {
            if self.fail_login.load(Ordering::SeqCst) {
                return Err(RpcError::AuthFailed("bad password".to_string()));
            }
            Ok("token-1".to_string())
        }

        async fn call(
            &self,
            _endpoint: &RpcEndpoint,
            _token: &str,
            method: &str,
            _args: Vec<Value>,
        ) -> Result<Value, RpcError> {
            Err(RpcError::Call(format!("unexpected raw call: {method}")))
        }

        async fn console_create(
            &self,
            _endpoint: &RpcEndpoint,
            _token: &str,
        ) -> Result<ConsoleCreated, RpcError> {
            let n = self.consoles_created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ConsoleCreated {
                id: format!("console-{n}"),
                prompt: String::new(),
            })
        }

        async fn console_destroy(
            &self,
            _endpoint: &RpcEndpoint,
            _token: &str,
            _console_id: &str,
        ) -> Result<(), RpcError> {
            Ok(())
        }

        async fn console_write(
            &self,
            _endpoint: &RpcEndpoint,
            _token: &str,
            _console_id: &str,
            data: &str,
        ) -> Result<u64, RpcError> {
            Ok(data.len() as u64)
        }

        async fn console_read(
            &self,
            _endpoint: &RpcEndpoint,
            _token: &str,
            _console_id: &str,
        ) -> Result<ConsoleRead, RpcError> {
            let mut reads = self.reads.lock().expect("reads");
            *reads += 1;
            if *reads == 1 {
                Ok(ConsoleRead {
                    data: "banner\nmsf6 > ".to_string(),
                    busy: false,
                    prompt: "msf6 > ".to_string(),
                })
            } else {
                Ok(ConsoleRead {
                    data: String::new(),
                    busy: false,
                    prompt: "msf6 > ".to_string(),
                })
            }
        }
    }

    fn fast_config() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.msgrpc_initial_delay = Duration::from_millis(10);
        cfg.msgrpc_connect_base_backoff = Duration::from_millis(10);
        cfg.base_backoff = Duration::from_millis(10);
        cfg.max_backoff = Duration::from_millis(50);
        cfg.console_restart_base_backoff = Duration::from_millis(10);
        cfg.console_restart_max_backoff = Duration::from_millis(50);
        cfg.health_check_interval = Duration::from_millis(25);
        cfg.console_poll_interval = Duration::from_millis(5);
        Arc::new(cfg)
    }

    fn record() -> ContainerRecord {
        ContainerRecord {
            id: 7,
            workspace_id: 1,
            workspace_slug: "acme".to_string(),
            slug: "msf-1".to_string(),
            name: "msf-1".to_string(),
            docker_image: "msfailab/msf:latest".to_string(),
        }
    }

    fn deps(docker: Arc<FakeDocker>, rpc: Arc<FakeRpc>, bus: EventBus) -> ControllerDeps {
        ControllerDeps {
            docker,
            rpc,
            bus,
            ports: PortAllocator::new(55553..=55653),
            config: fast_config(),
        }
    }

    async fn wait_for_status(
        handle: &ControllerHandle,
        want: ContainerStatus,
    ) -> ControllerSnapshot {
        for _ in 0..200 {
            if let Some(snap) = handle.snapshot().await {
                if snap.status == want {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("controller never reached {want:?}");
    }

    async fn wait_for_console(
        handle: &ControllerHandle,
        track_id: i64,
    ) -> ControllerSnapshot {
        for _ in 0..200 {
            if let Some(snap) = handle.snapshot().await {
                if snap.console_tracks.contains(&track_id) {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("console for track {track_id} never appeared");
    }

    #[tokio::test]
    async fn cold_start_reaches_running_with_console() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe(1);

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc, bus));
        handle.register_console(42).await;

        let snap = wait_for_status(&handle, ContainerStatus::Running).await;
        assert!(snap.has_auth_token);
        assert!(snap.rpc_endpoint.is_some());

        let snap = wait_for_console(&handle, 42).await;
        assert!(snap.console_tracks.is_subset(&snap.registered_tracks));

        // Event order: offline, starting, running on the container topic.
        let mut container_statuses = Vec::new();
        let mut console_statuses = Vec::new();
        while container_statuses.len() < 3 || console_statuses.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("bus closed")
            {
                Event::ContainerUpdated(e) => container_statuses.push(e.status),
                Event::ConsoleUpdated(e) => console_statuses.push(e.status),
                _ => {}
            }
        }
        assert_eq!(
            container_statuses[..3],
            [
                ContainerStatus::Offline,
                ContainerStatus::Starting,
                ContainerStatus::Running
            ]
        );
        assert_eq!(console_statuses[0], ConsoleStatus::Starting);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc.clone(), bus));
        handle.register_console(42).await;
        wait_for_console(&handle, 42).await;

        handle.register_console(42).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No second remote console was created for the same track.
        assert_eq!(rpc.consoles_created.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_then_register_yields_fresh_session() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe(1);

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc.clone(), bus));
        handle.register_console(42).await;
        wait_for_console(&handle, 42).await;

        handle.unregister_console(42).await;
        let snap = handle.snapshot().await.expect("snapshot");
        assert!(snap.console_tracks.is_empty());
        assert!(snap.registered_tracks.is_empty());

        handle.register_console(42).await;
        wait_for_console(&handle, 42).await;
        assert_eq!(rpc.consoles_created.load(Ordering::SeqCst), 2);

        // Somewhere in the stream: an offline followed by starting and ready.
        let mut saw_offline = false;
        let mut saw_starting_after_offline = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(200), events.recv()).await
            else {
                break;
            };
            if let Event::ConsoleUpdated(e) = event {
                match e.status {
                    ConsoleStatus::Offline => saw_offline = true,
                    ConsoleStatus::Starting if saw_offline => {
                        saw_starting_after_offline = true;
                        break;
                    }
                    _ => {}
                }
            }
        }
        assert!(saw_offline, "no offline event after unregister");
        assert!(saw_starting_after_offline, "no fresh session after register");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn container_crash_offlines_consoles_and_restarts() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe(1);

        let handle = ControllerHandle::spawn(record(), deps(docker.clone(), rpc, bus));
        handle.register_console(42).await;
        wait_for_console(&handle, 42).await;

        // Kill the container behind the controller's back.
        docker.running.store(false, Ordering::SeqCst);

        // Health check notices, consoles offline, then a restart cycle.
        let mut saw_console_offline = false;
        let mut saw_running_again = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(500), events.recv()).await
            else {
                break;
            };
            match event {
                Event::ConsoleUpdated(e)
                    if e.status == ConsoleStatus::Offline && e.track_id == 42 =>
                {
                    saw_console_offline = true;
                }
                Event::ContainerUpdated(e)
                    if e.status == ContainerStatus::Running && saw_console_offline =>
                {
                    saw_running_again = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_console_offline, "no console offline after crash");
        assert!(saw_running_again, "container did not restart");

        let snap = wait_for_console(&handle, 42).await;
        assert_eq!(snap.restart_count, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn port_exhaustion_keeps_container_offline() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();

        let ports = PortAllocator::new(55553..=55554);
        ports.allocate().expect("hold one");
        ports.allocate().expect("hold two");

        let deps = ControllerDeps {
            docker,
            rpc,
            bus,
            ports,
            config: fast_config(),
        };
        let handle = ControllerHandle::spawn(record(), deps);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = handle.snapshot().await.expect("snapshot");
        assert_eq!(snap.status, ContainerStatus::Offline);
        assert!(snap.restart_count >= 1);
        assert!(snap.docker_container_id.is_none());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_restarts_until_external_start() {
        let docker = FakeDocker::new();
        docker.fail_start.store(true, Ordering::SeqCst);
        let rpc = FakeRpc::new();
        let bus = EventBus::new();

        let handle = ControllerHandle::spawn(record(), deps(docker.clone(), rpc, bus));

        // All five attempts fail quickly, then the controller stops trying.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let snap = handle.snapshot().await.expect("snapshot");
        assert_eq!(snap.status, ContainerStatus::Offline);
        assert_eq!(snap.restart_count, 5);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = handle.snapshot().await.expect("snapshot");
        assert_eq!(snap.restart_count, 5, "no further attempts after give-up");

        // External start resumes attempts.
        docker.fail_start.store(false, Ordering::SeqCst);
        handle.start_new().await;
        wait_for_status(&handle, ContainerStatus::Running).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bash_command_streams_results() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe(1);

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc, bus));
        wait_for_status(&handle, ContainerStatus::Running).await;

        let command_id = handle
            .send_bash_command(42, "uname -a")
            .await
            .expect("accepted");

        let mut saw_issued = false;
        let mut saw_running = false;
        let mut saw_finished = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline && !saw_finished {
            let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(500), events.recv()).await
            else {
                break;
            };
            match event {
                Event::CommandIssued(e) if e.command_id == command_id => {
                    assert_eq!(e.kind, CommandKind::Bash);
                    assert_eq!(e.command, "uname -a");
                    saw_issued = true;
                }
                Event::CommandResult(e) if e.command_id == command_id => match e.status {
                    CommandStatus::Running => saw_running = true,
                    CommandStatus::Finished => {
                        assert_eq!(e.exit_code, Some(0));
                        assert!(e.output.contains("ran: uname -a"));
                        saw_finished = true;
                    }
                    CommandStatus::Error => panic!("unexpected error result"),
                },
                _ => {}
            }
        }
        assert!(saw_issued && saw_running && saw_finished);

        // Terminal command is no longer tracked.
        assert!(handle.running_bash_commands().await.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn commands_rejected_while_not_running() {
        let docker = FakeDocker::new();
        docker.fail_start.store(true, Ordering::SeqCst);
        let rpc = FakeRpc::new();
        let bus = EventBus::new();

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc, bus));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            handle.send_metasploit_command(42, "db_status").await,
            Err(CommandError::ContainerNotRunning)
        );
        assert_eq!(
            handle.send_bash_command(42, "id").await,
            Err(CommandError::ContainerNotRunning)
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn msf_command_requires_registration() {
        let docker = FakeDocker::new();
        let rpc = FakeRpc::new();
        let bus = EventBus::new();

        let handle = ControllerHandle::spawn(record(), deps(docker, rpc, bus));
        wait_for_status(&handle, ContainerStatus::Running).await;

        assert_eq!(
            handle.send_metasploit_command(42, "db_status").await,
            Err(CommandError::ConsoleNotRegistered)
        );
        handle.shutdown().await;
    }

    #[test]
    fn truncate_output_snips_middle() {
        let big = "x".repeat(MAX_BASH_OUTPUT + 100);
        let out = truncate_output(&big);
        assert!(out.len() < big.len());
        assert!(out.contains("snipped"));
        let small = "hello".to_string();
        assert_eq!(truncate_output(&small), "hello");
    }
}
