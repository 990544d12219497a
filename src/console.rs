//! Console session actor
//!
//! Wraps one remote Metasploit console: `starting -> ready <-> busy`, with a
//! polling loop that promotes to ready on an idle read and streams busy output
//! as deltas. Exactly one command may be outstanding; the remote console is a
//! global PTY with no multiplexing, so a busy console rejects instead of
//! queueing.
//!
//! Read/write failures kill the session. The controller monitors the task and
//! emits the `offline` event on its behalf — a dead emitter cannot emit.

use crate::bus::{ConsoleStatus, ConsoleUpdated, Event, EventBus};
use crate::docker::RpcEndpoint;
use crate::rpc::{ConsoleRead, MsfRpc, RpcError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identity stamped on every event this session emits.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleMeta {
    pub workspace_id: i64,
    pub container_id: i64,
    pub track_id: i64,
}

pub struct ConsoleOpts {
    pub rpc: Arc<dyn MsfRpc>,
    pub endpoint: RpcEndpoint,
    pub token: String,
    pub bus: EventBus,
    pub meta: ConsoleMeta,
    pub poll_interval: Duration,
    pub prompt_terminators: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("console is starting")]
    Starting,
    #[error("console is busy")]
    Busy,
    #[error("console write failed")]
    WriteFailed,
    #[error("console is offline")]
    Offline,
}

enum ConsoleMsg {
    SendCommand {
        text: String,
        reply: oneshot::Sender<Result<String, SendError>>,
    },
    GetStatus {
        reply: oneshot::Sender<ConsoleStatus>,
    },
    GetPrompt {
        reply: oneshot::Sender<String>,
    },
    GoOffline {
        reply: oneshot::Sender<()>,
    },
}

/// Handle held by the controller. Dropping it does not stop the session; the
/// controller sends `GoOffline` for orderly teardown.
pub struct ConsoleHandle {
    tx: mpsc::Sender<ConsoleMsg>,
    pub remote_console_id: String,
    pub join: Option<JoinHandle<()>>,
}

impl ConsoleHandle {
    pub async fn send_command(&self, text: impl Into<String>) -> Result<String, SendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = ConsoleMsg::SendCommand {
            text: text.into(),
            reply: reply_tx,
        };
        if self.tx.send(msg).await.is_err() {
            return Err(SendError::Offline);
        }
        reply_rx.await.unwrap_or(Err(SendError::Offline))
    }

    pub async fn status(&self) -> Option<ConsoleStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConsoleMsg::GetStatus { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn prompt(&self) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConsoleMsg::GetPrompt { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Destroy the remote console and stop the session task.
    pub async fn go_offline(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ConsoleMsg::GoOffline { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Create the remote console and spawn the session task. A creation failure
/// is a spawn failure; the controller applies its console restart policy.
pub async fn start(opts: ConsoleOpts) -> Result<ConsoleHandle, RpcError> {
    let created = opts.rpc.console_create(&opts.endpoint, &opts.token).await?;

    let (tx, rx) = mpsc::channel(16);
    let session = Session {
        rpc: opts.rpc,
        endpoint: opts.endpoint,
        token: opts.token,
        bus: opts.bus,
        meta: opts.meta,
        remote_id: created.id.clone(),
        status: ConsoleStatus::Starting,
        current_prompt: created.prompt,
        pending: None,
        terminators: opts.prompt_terminators,
        poll_interval: opts.poll_interval,
    };

    session.emit(ConsoleStatus::Starting, None, None, String::new());

    let join = tokio::spawn(session.run(rx));

    Ok(ConsoleHandle {
        tx,
        remote_console_id: created.id,
        join: Some(join),
    })
}

struct PendingCommand {
    command_id: String,
    text: String,
}

struct Session {
    rpc: Arc<dyn MsfRpc>,
    endpoint: RpcEndpoint,
    token: String,
    bus: EventBus,
    meta: ConsoleMeta,
    remote_id: String,
    status: ConsoleStatus,
    current_prompt: String,
    pending: Option<PendingCommand>,
    terminators: Vec<String>,
    poll_interval: Duration,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::Receiver<ConsoleMsg>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ConsoleMsg::SendCommand { text, reply }) => {
                        if !self.handle_send(text, reply).await {
                            return;
                        }
                    }
                    Some(ConsoleMsg::GetStatus { reply }) => {
                        let _ = reply.send(self.status);
                    }
                    Some(ConsoleMsg::GetPrompt { reply }) => {
                        let _ = reply.send(self.current_prompt.clone());
                    }
                    Some(ConsoleMsg::GoOffline { reply }) => {
                        if let Err(e) = self
                            .rpc
                            .console_destroy(&self.endpoint, &self.token, &self.remote_id)
                            .await
                        {
                            tracing::debug!(
                                console = %self.remote_id,
                                error = %e,
                                "console destroy failed during teardown"
                            );
                        }
                        let _ = reply.send(());
                        return;
                    }
                    None => return,
                },
                _ = poll.tick() => {
                    match self
                        .rpc
                        .console_read(&self.endpoint, &self.token, &self.remote_id)
                        .await
                    {
                        Ok(read) => self.handle_read(read),
                        Err(e) => {
                            tracing::warn!(
                                console = %self.remote_id,
                                track_id = self.meta.track_id,
                                error = %e,
                                "console read failed, session dying"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns false when the session must die (write failure).
    async fn handle_send(
        &mut self,
        text: String,
        reply: oneshot::Sender<Result<String, SendError>>,
    ) -> bool {
        match self.status {
            ConsoleStatus::Starting => {
                let _ = reply.send(Err(SendError::Starting));
                true
            }
            ConsoleStatus::Busy => {
                let _ = reply.send(Err(SendError::Busy));
                true
            }
            ConsoleStatus::Ready => {
                let data = format!("{text}\n");
                match self
                    .rpc
                    .console_write(&self.endpoint, &self.token, &self.remote_id, &data)
                    .await
                {
                    Ok(_) => {
                        let command_id = uuid::Uuid::new_v4().to_string();
                        self.pending = Some(PendingCommand {
                            command_id: command_id.clone(),
                            text,
                        });
                        self.status = ConsoleStatus::Busy;
                        let _ = reply.send(Ok(command_id));
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            console = %self.remote_id,
                            track_id = self.meta.track_id,
                            error = %e,
                            "console write failed, session dying"
                        );
                        let _ = reply.send(Err(SendError::WriteFailed));
                        false
                    }
                }
            }
            ConsoleStatus::Offline => {
                let _ = reply.send(Err(SendError::Offline));
                true
            }
        }
    }

    fn handle_read(&mut self, read: ConsoleRead) {
        let (delta, extracted) = extract_prompt(&read.data, &self.terminators);
        if let Some(prompt) = extracted {
            self.current_prompt = prompt;
        } else if !read.prompt.is_empty() {
            self.current_prompt = read.prompt.clone();
        }

        match self.status {
            ConsoleStatus::Starting => {
                if !delta.is_empty() {
                    self.emit(ConsoleStatus::Starting, None, None, delta);
                }
                if !read.busy && read.data.is_empty() {
                    // Idle read with a settled prompt: the console is usable.
                    self.status = ConsoleStatus::Ready;
                    self.emit(ConsoleStatus::Ready, None, None, String::new());
                }
            }
            ConsoleStatus::Busy => {
                if !delta.is_empty() {
                    let (command_id, text) = self
                        .pending
                        .as_ref()
                        .map(|p| (p.command_id.clone(), p.text.clone()))
                        .unwrap_or_default();
                    self.emit(
                        ConsoleStatus::Busy,
                        Some(command_id),
                        Some(text),
                        delta,
                    );
                }
                if !read.busy {
                    // Command completion: readiness is the signal, the track
                    // engine closes the command.
                    self.pending = None;
                    self.status = ConsoleStatus::Ready;
                    self.emit(ConsoleStatus::Ready, None, None, String::new());
                }
            }
            ConsoleStatus::Ready => {
                if !delta.is_empty() {
                    tracing::debug!(
                        console = %self.remote_id,
                        bytes = delta.len(),
                        "dropping unsolicited console output while idle"
                    );
                }
            }
            ConsoleStatus::Offline => {}
        }
    }

    fn emit(
        &self,
        status: ConsoleStatus,
        command_id: Option<String>,
        command: Option<String>,
        output: String,
    ) {
        self.bus.broadcast(Event::ConsoleUpdated(ConsoleUpdated {
            workspace_id: self.meta.workspace_id,
            container_id: self.meta.container_id,
            track_id: self.meta.track_id,
            status,
            command_id,
            command,
            output,
            prompt: self.current_prompt.clone(),
            ts: Utc::now(),
        }));
    }
}

/// Split a read chunk into the output delta and the trailing prompt line.
/// The prompt is the last line whose end matches a configured terminator; it
/// is removed from the emitted delta.
pub fn extract_prompt(chunk: &str, terminators: &[String]) -> (String, Option<String>) {
    if chunk.is_empty() {
        return (String::new(), None);
    }
    let (rest, last) = match chunk.rfind('\n') {
        Some(i) => chunk.split_at(i + 1),
        None => ("", chunk),
    };
    if !last.is_empty() && terminators.iter().any(|t| last.ends_with(t.as_str())) {
        (rest.to_string(), Some(last.to_string()))
    } else {
        (chunk.to_string(), None)
    }
}
