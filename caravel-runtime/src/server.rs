//! The consensus server: the single consumer loop around the engine.
//!
//! [`ConsensusServer`] owns all mutable consensus state. One task drains
//! the dispatcher, fires the election and heartbeat timers, and admits
//! client commands; every mutation path funnels through that task, so the
//! engine itself needs no locking. Network I/O runs concurrently and talks
//! to the loop only through the dispatcher (inbound) and fire-and-forget
//! transport sends (outbound).
//!
//! Durability: the loop persists the engine's hard state before any message
//! that reveals a term or vote change leaves the node, and mirrors log
//! appends into the durable store before acknowledging clients.

use std::sync::Arc;

use bytes::Bytes;
use caravel_core::{Address, AddressInput, LogIndex, Term};
use caravel_raft::{
    CommandError, CommandOutcome, ConsensusEngine, EngineConfig, EngineOutput, HardState,
    LogStore, NodePool, PendingCommands, Role, StorageResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, TimingConfig};
use crate::dispatcher::IncomingDispatcher;
use crate::transport::Transport;

/// Capacity of the server command channel.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// The replicated state machine commands are applied to.
///
/// Implementations must be deterministic: every node applies the same
/// committed commands in the same order and must arrive at the same state.
pub trait StateMachine: Send {
    /// Applies a committed command and returns its result.
    fn apply(&mut self, command: &Bytes) -> Bytes;
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A log entry reached majority commit and was applied.
    Committed {
        /// The log index.
        index: LogIndex,
        /// The committed command.
        command: Bytes,
    },
    /// This node became the leader.
    BecameLeader {
        /// The term it leads.
        term: Term,
    },
    /// This node lost leadership to a higher term.
    SteppedDown {
        /// The term it observed.
        term: Term,
    },
}

/// A point-in-time view of the server's consensus state.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    /// The node's current role.
    pub role: Role,
    /// The current term.
    pub term: Term,
    /// The believed leader, if known.
    pub leader_hint: Option<Address>,
    /// The commit index.
    pub commit_index: LogIndex,
    /// The last index in the local log.
    pub last_log_index: LogIndex,
    /// Snapshot of the current remote membership.
    pub members: Vec<Address>,
}

/// Commands sent into the server loop.
enum ServerCommand {
    Submit {
        command: Bytes,
        respond: oneshot::Sender<Result<CommandOutcome, CommandError>>,
    },
    AddMember {
        input: AddressInput,
        respond: oneshot::Sender<Option<Address>>,
    },
    RemoveMember {
        input: AddressInput,
        respond: oneshot::Sender<Option<Address>>,
    },
    Status {
        respond: oneshot::Sender<ServerStatus>,
    },
    Shutdown,
}

/// Handle to interact with a running server.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
    request_timeout: std::time::Duration,
}

impl ServerHandle {
    /// Submits a command for replication.
    ///
    /// Resolves only after the command is committed on a majority and
    /// applied locally; there is no optimistic acknowledgment.
    ///
    /// # Errors
    /// - [`CommandError::NotLeader`] with a redirect hint when this node
    ///   does not lead
    /// - [`CommandError::NoMajority`] when the leader cannot confirm
    ///   majority reachability
    /// - [`CommandError::OutdatedTerm`] when leadership was lost while the
    ///   command was in flight
    /// - [`CommandError::Timeout`] when the commit did not happen within
    ///   the operation timeout
    pub async fn submit(&self, command: Bytes) -> Result<CommandOutcome, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Submit {
                command,
                respond: tx,
            })
            .await
            .map_err(|_| CommandError::Unavailable)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CommandError::Unavailable),
            Err(_) => Err(CommandError::Timeout),
        }
    }

    /// Adds a peer to the cluster membership.
    ///
    /// Returns the normalized address when the membership actually changed.
    ///
    /// # Errors
    /// Returns [`CommandError::Unavailable`] when the server loop is gone.
    pub async fn add_member(
        &self,
        candidate: impl Into<AddressInput> + Send,
    ) -> Result<Option<Address>, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::AddMember {
                input: candidate.into(),
                respond: tx,
            })
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)
    }

    /// Removes a peer from the cluster membership.
    ///
    /// Returns the normalized address when the membership actually changed.
    ///
    /// # Errors
    /// Returns [`CommandError::Unavailable`] when the server loop is gone.
    pub async fn remove_member(
        &self,
        candidate: impl Into<AddressInput> + Send,
    ) -> Result<Option<Address>, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::RemoveMember {
                input: candidate.into(),
                respond: tx,
            })
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)
    }

    /// Returns a snapshot of the server's consensus state.
    ///
    /// # Errors
    /// Returns [`CommandError::Unavailable`] when the server loop is gone.
    pub async fn status(&self) -> Result<ServerStatus, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Status { respond: tx })
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)
    }

    /// Requests the server to shut down.
    ///
    /// # Errors
    /// Returns [`CommandError::Unavailable`] when the server loop is gone.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        self.commands
            .send(ServerCommand::Shutdown)
            .await
            .map_err(|_| CommandError::Unavailable)
    }
}

/// The consensus server for one node.
pub struct ConsensusServer {
    engine: ConsensusEngine,
    store: Box<dyn LogStore + Send>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<IncomingDispatcher>,
    pending: PendingCommands,
    timing: TimingConfig,
    events: mpsc::Sender<ServerEvent>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl ConsensusServer {
    /// Creates a server, restoring any persisted state from `store`.
    ///
    /// # Errors
    /// Returns an error when persisted state cannot be read.
    pub fn new(
        config: NodeConfig,
        store: Box<dyn LogStore + Send>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<IncomingDispatcher>,
        events: mpsc::Sender<ServerEvent>,
    ) -> StorageResult<Self> {
        let pool = NodePool::new(config.peers.clone(), Some(config.local.clone()));
        let mut engine = ConsensusEngine::new(EngineConfig::new(config.local), pool);

        let hard_state = store.load_hard_state()?.unwrap_or_default();
        let entries = store.entries(LogIndex::new(1), store.last_index())?;
        engine.restore(hard_state, entries);

        let now = Instant::now();
        Ok(Self {
            engine,
            store,
            state_machine,
            transport,
            dispatcher,
            pending: PendingCommands::new(),
            timing: config.timing,
            events,
            election_deadline: now,
            heartbeat_deadline: now,
        })
    }

    /// Runs the server, returning a handle for interaction and the loop
    /// future for the caller to spawn.
    pub fn run(mut self) -> (ServerHandle, impl std::future::Future<Output = ()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = ServerHandle {
            commands: cmd_tx,
            request_timeout: self.timing.request_timeout,
        };

        let future = async move {
            self.election_deadline = Instant::now() + self.timing.random_election_timeout();
            self.heartbeat_deadline = Instant::now() + self.timing.heartbeat_interval;

            // Cloned out of `self` so the readable future does not hold a
            // borrow across the handler bodies.
            let dispatcher = Arc::clone(&self.dispatcher);

            loop {
                tokio::select! {
                    Some(command) = cmd_rx.recv() => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }

                    () = dispatcher.readable() => {
                        while let Some(message) = self.dispatcher.next() {
                            let outputs = self.engine.handle_message(message);
                            self.persist_log();
                            self.execute(outputs).await;
                        }
                    }

                    () = tokio::time::sleep_until(self.election_deadline) => {
                        // Always re-arm; the engine may override via its
                        // own ResetElectionTimer output.
                        self.election_deadline =
                            Instant::now() + self.timing.random_election_timeout();
                        let outputs = self.engine.handle_election_timeout();
                        self.execute(outputs).await;
                    }

                    () = tokio::time::sleep_until(self.heartbeat_deadline) => {
                        self.heartbeat_deadline =
                            Instant::now() + self.timing.heartbeat_interval;
                        let outputs = self.engine.handle_heartbeat_timeout();
                        self.execute(outputs).await;
                    }
                }
            }

            info!(local = %self.engine.local(), "server loop stopped");
        };

        (handle, future)
    }

    /// Handles one command from the handle; returns true on shutdown.
    async fn handle_command(&mut self, command: ServerCommand) -> bool {
        match command {
            ServerCommand::Submit { command, respond } => {
                match self.engine.submit(command) {
                    Ok((index, outputs)) => {
                        self.persist_log();
                        // Register before executing: a single-node cluster
                        // commits inside this very output batch.
                        self.pending
                            .register(index, self.engine.current_term(), respond);
                        self.execute(outputs).await;
                    }
                    Err(e) => {
                        debug!(local = %self.engine.local(), code = e.code(), "command rejected");
                        let _ = respond.send(Err(e));
                    }
                }
                false
            }
            ServerCommand::AddMember { input, respond } => {
                let _ = respond.send(self.engine.pool_mut().add(input));
                false
            }
            ServerCommand::RemoveMember { input, respond } => {
                let _ = respond.send(self.engine.pool_mut().remove(input));
                false
            }
            ServerCommand::Status { respond } => {
                let _ = respond.send(ServerStatus {
                    role: self.engine.role(),
                    term: self.engine.current_term(),
                    leader_hint: self.engine.leader_hint().cloned(),
                    commit_index: self.engine.commit_index(),
                    last_log_index: self.engine.log().last_index(),
                    members: self.engine.pool().addresses(),
                });
                false
            }
            ServerCommand::Shutdown => {
                info!(local = %self.engine.local(), "server shutting down");
                self.pending.fail_all(&CommandError::Unavailable);
                true
            }
        }
    }

    /// Carries out the effects the engine asked for, in order.
    ///
    /// Outbound sends are gathered and dispatched after the rest of the
    /// batch, so a hard-state persist always lands before any message that
    /// depends on it.
    async fn execute(&mut self, outputs: Vec<EngineOutput>) {
        let mut outgoing = Vec::new();

        for output in outputs {
            match output {
                EngineOutput::Send(message) => outgoing.push(message),
                EngineOutput::PersistHardState(state) => {
                    if let Err(e) = self.persist_hard_state(&state) {
                        // A term or vote that is not durable must not be
                        // revealed to the cluster.
                        error!(error = %e, "failed to persist hard state, suppressing outbound messages");
                        return;
                    }
                }
                EngineOutput::ResetElectionTimer => {
                    self.election_deadline =
                        Instant::now() + self.timing.random_election_timeout();
                }
                EngineOutput::ResetHeartbeatTimer => {
                    self.heartbeat_deadline = Instant::now() + self.timing.heartbeat_interval;
                }
                EngineOutput::Commit { entry } => {
                    let result = self.state_machine.apply(&entry.command);
                    info!(
                        local = %self.engine.local(),
                        index = entry.index.get(),
                        "entry committed"
                    );
                    self.pending.complete(
                        entry.index,
                        entry.term,
                        result,
                        self.engine.leader_hint(),
                    );
                    let _ = self
                        .events
                        .send(ServerEvent::Committed {
                            index: entry.index,
                            command: entry.command,
                        })
                        .await;
                }
                EngineOutput::BecameLeader => {
                    info!(
                        local = %self.engine.local(),
                        term = self.engine.current_term().get(),
                        "became leader"
                    );
                    let _ = self
                        .events
                        .send(ServerEvent::BecameLeader {
                            term: self.engine.current_term(),
                        })
                        .await;
                }
                EngineOutput::SteppedDown => {
                    warn!(
                        local = %self.engine.local(),
                        term = self.engine.current_term().get(),
                        "stepped down from leadership"
                    );
                    // Every in-flight command resolves as outdated; the
                    // client restarts against the new leader once known.
                    self.pending.fail_all(&CommandError::OutdatedTerm {
                        leader_hint: self.engine.leader_hint().cloned(),
                    });
                    let _ = self
                        .events
                        .send(ServerEvent::SteppedDown {
                            term: self.engine.current_term(),
                        })
                        .await;
                }
            }
        }

        for message in outgoing {
            if let Err(e) = self.transport.send(message).await {
                warn!(local = %self.engine.local(), error = %e, "failed to hand message to transport");
            }
        }
    }

    fn persist_hard_state(&mut self, state: &HardState) -> StorageResult<()> {
        self.store.save_hard_state(state)?;
        self.store.sync()
    }

    /// Mirrors the engine's in-memory log into the durable store.
    ///
    /// Walks back from the tail to the highest index where the stored term
    /// agrees with the engine's, truncates the divergent suffix, and
    /// appends what the store is missing.
    fn persist_log(&mut self) {
        let result = (|| -> StorageResult<()> {
            let engine_last = self.engine.log().last_index();
            let mut base = self.store.last_index().min(engine_last);

            while base > LogIndex::ZERO {
                let stored_term = self
                    .store
                    .entries(base, base)?
                    .first()
                    .map(|entry| entry.term);
                if stored_term == Some(self.engine.log().term_at(base)) {
                    break;
                }
                base = LogIndex::new(base.get() - 1);
            }

            self.store.truncate_after(base)?;
            let missing = self.engine.log().entries_from(base.next());
            if !missing.is_empty() {
                self.store.append_entries(&missing)?;
            }
            self.store.sync()
        })();

        if let Err(e) = result {
            error!(local = %self.engine.local(), error = %e, "failed to persist log entries");
        }
    }
}
