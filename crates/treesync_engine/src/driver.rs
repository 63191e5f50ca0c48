//! Async driver that owns a session on a tokio task.
//!
//! The driver serializes everything that touches the session: inbound
//! messages from the transport's read side, commands from
//! [`DriverHandle`]s and timer wakeups. Inbound messages are drained
//! before commands, and both before timers.

use crate::clock::Clock;
use crate::connection::ConnectionState;
use crate::error::{SyncError, SyncResult};
use crate::on::{EventHandler, EventKind, SubscriptionHandle};
use crate::session::{Session, SessionStats};
use crate::transport::Transport;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use treesync_codec::Value;
use treesync_core::Path;
use treesync_protocol::{InboundMessage, RequestId, UpdateKind};

const COMMAND_CAPACITY: usize = 256;

/// A write or auth request the server has not answered yet.
#[derive(Debug)]
pub struct PendingWrite {
    id: RequestId,
    outcome: oneshot::Receiver<SyncResult<Option<Value>>>,
}

impl PendingWrite {
    /// Request id on the wire.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the server's answer.
    ///
    /// # Errors
    ///
    /// Returns the rejection, or [`SyncError::Cancelled`] if the session
    /// went away first.
    pub async fn completed(self) -> SyncResult<Option<Value>> {
        self.outcome.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

fn completion() -> (
    oneshot::Sender<SyncResult<Option<Value>>>,
    oneshot::Receiver<SyncResult<Option<Value>>>,
) {
    oneshot::channel()
}

enum Command {
    Watch {
        path: Path,
        kind: EventKind,
        handler: Box<dyn EventHandler>,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unwatch {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Write {
        kind: UpdateKind,
        path: Path,
        value: Value,
        reply: oneshot::Sender<SyncResult<PendingWrite>>,
    },
    Push {
        path: Path,
        value: Value,
        reply: oneshot::Sender<SyncResult<(String, PendingWrite)>>,
    },
    Authenticate {
        credential: String,
        reply: oneshot::Sender<PendingWrite>,
    },
    Connect {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Close {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    ValueAt {
        path: Path,
        reply: oneshot::Sender<Value>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown,
}

/// Runs a [`Session`] until shut down.
pub struct Driver<T: Transport, C: Clock> {
    session: Session<T, C>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
}

impl<T: Transport, C: Clock> Driver<T, C> {
    /// Wraps a session. Spawn [`Driver::run`] and talk to it through the
    /// returned handle.
    pub fn new(session: Session<T, C>) -> (Self, DriverHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let driver = Self {
            session,
            commands,
            inbound,
            inbound_tx,
        };
        (driver, DriverHandle { commands: command_tx })
    }

    /// Sender for the transport's read side.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Processes events until shutdown or until every handle is dropped,
    /// then hands the session back.
    pub async fn run(mut self) -> Session<T, C> {
        info!("driver started");
        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                biased;
                Some(message) = self.inbound.recv() => self.session.handle_message(message),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command),
                },
                () = sleep_until(deadline) => self.session.tick(),
            }
        }
        info!("driver stopped");
        self.session
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Watch {
                path,
                kind,
                handler,
                reply,
            } => {
                let _ = reply.send(self.session.watch_boxed(&path, kind, handler));
            }
            Command::Unwatch { handle, reply } => {
                let _ = reply.send(self.session.unwatch(handle));
            }
            Command::Write {
                kind,
                path,
                value,
                reply,
            } => {
                let (tx, outcome) = completion();
                let on_complete = move |_: RequestId, result: SyncResult<Option<Value>>| {
                    let _ = tx.send(result);
                };
                let submitted = match kind {
                    UpdateKind::Put => self.session.write_with(&path, value, on_complete),
                    UpdateKind::Merge => self.session.merge_with(&path, value, on_complete),
                };
                let _ = reply.send(submitted.map(|id| PendingWrite { id, outcome }));
            }
            Command::Push { path, value, reply } => {
                let (tx, outcome) = completion();
                let submitted = self.session.push_with(&path, value, move |_, result| {
                    let _ = tx.send(result);
                });
                let _ = reply.send(submitted.map(|(key, id)| (key, PendingWrite { id, outcome })));
            }
            Command::Authenticate { credential, reply } => {
                let (tx, outcome) = completion();
                let id = self.session.authenticate_with(credential, move |_, result| {
                    let _ = tx.send(result);
                });
                let _ = reply.send(PendingWrite { id, outcome });
            }
            Command::Connect { reply } => {
                let _ = reply.send(self.session.connect());
            }
            Command::Close { reply } => {
                let _ = reply.send(self.session.close());
            }
            Command::ValueAt { path, reply } => {
                let _ = reply.send(self.session.value_at(&path));
            }
            Command::State { reply } => {
                let _ = reply.send(self.session.state());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.session.stats().clone());
            }
            Command::Shutdown => debug!("shutdown handled by run loop"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle for talking to a running [`Driver`].
///
/// Every method fails with [`SyncError::Cancelled`] once the driver has
/// stopped.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Watch { .. } => "Watch",
            Command::Unwatch { .. } => "Unwatch",
            Command::Write { .. } => "Write",
            Command::Push { .. } => "Push",
            Command::Authenticate { .. } => "Authenticate",
            Command::Connect { .. } => "Connect",
            Command::Close { .. } => "Close",
            Command::ValueAt { .. } => "ValueAt",
            Command::State { .. } => "State",
            Command::Stats { .. } => "Stats",
            Command::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl DriverHandle {
    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> SyncResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::Cancelled)?;
        response.await.map_err(|_| SyncError::Cancelled)
    }

    /// See [`Session::watch`].
    pub async fn watch<H>(
        &self,
        path: Path,
        kind: EventKind,
        handler: H,
    ) -> SyncResult<SubscriptionHandle>
    where
        H: EventHandler + 'static,
    {
        let handler: Box<dyn EventHandler> = Box::new(handler);
        self.request(|reply| Command::Watch {
            path,
            kind,
            handler,
            reply,
        })
        .await
    }

    /// See [`Session::unwatch`].
    pub async fn unwatch(&self, handle: SubscriptionHandle) -> SyncResult<()> {
        self.request(|reply| Command::Unwatch { handle, reply }).await?
    }

    /// See [`Session::write`].
    pub async fn write(&self, path: Path, value: Value) -> SyncResult<PendingWrite> {
        self.request(|reply| Command::Write {
            kind: UpdateKind::Put,
            path,
            value,
            reply,
        })
        .await?
    }

    /// See [`Session::merge`].
    pub async fn merge(&self, path: Path, value: Value) -> SyncResult<PendingWrite> {
        self.request(|reply| Command::Write {
            kind: UpdateKind::Merge,
            path,
            value,
            reply,
        })
        .await?
    }

    /// See [`Session::push`].
    pub async fn push(&self, path: Path, value: Value) -> SyncResult<(String, PendingWrite)> {
        self.request(|reply| Command::Push { path, value, reply }).await?
    }

    /// See [`Session::authenticate`].
    pub async fn authenticate(&self, credential: impl Into<String>) -> SyncResult<PendingWrite> {
        let credential = credential.into();
        self.request(|reply| Command::Authenticate { credential, reply })
            .await
    }

    /// See [`Session::connect`].
    pub async fn connect(&self) -> SyncResult<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// See [`Session::close`].
    pub async fn close(&self) -> SyncResult<()> {
        self.request(|reply| Command::Close { reply }).await?
    }

    /// Cached value at `path`.
    pub async fn value_at(&self, path: Path) -> SyncResult<Value> {
        self.request(|reply| Command::ValueAt { path, reply }).await
    }

    /// Current connection state.
    pub async fn state(&self) -> SyncResult<ConnectionState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Snapshot of the session counters.
    pub async fn stats(&self) -> SyncResult<SessionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stops the driver. [`Driver::run`] returns the session.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| SyncError::Cancelled)
    }
}
