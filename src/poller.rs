//! Command polling loop.
//!
//! [`DatabasePoller`] repeatedly claims at most one pending command, hands
//! it to a [`CommandProcessor`], and writes the terminal status back:
//!
//! ```text
//! Idle ──activate──▶ Claiming ──command──▶ Processing ──▶ Waiting ──interval──▶ Claiming
//!                       │                                    ▲
//!                       └────────────none / store error──────┘
//! ```
//!
//! One tokio task runs the loop. The next cycle is armed only after the
//! current one finished, so cycles never overlap however long processing
//! takes. `deactivate` is cooperative: an in-flight cycle runs to
//! completion and the loop exits before arming another.
//!
//! Store failures while claiming or updating status are logged and the
//! loop carries on at the next interval. The processor runs on its own
//! task, so a panicking handler marks its command `ERROR` instead of
//! taking the loop down. A claimed row that cannot be decoded is marked
//! `ERROR` too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::command::CommandProcessor;
use crate::datastore::DataStore;
use crate::models::{ClaimedCommand, Command, CommandStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Not activated, no loop running.
    Idle,
    /// Between cycles.
    Waiting,
    Claiming,
    Processing,
}

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No pending command.
    Empty,
    Completed { id: String },
    /// The command was marked `ERROR` with this message.
    Failed { id: String, error: String },
    /// Claiming failed; nothing was processed.
    StoreError(String),
    /// The command ran but its terminal status could not be written.
    StatusNotRecorded {
        id: String,
        status: CommandStatus,
        error: String,
    },
}

struct Shared {
    datastore: Arc<DataStore>,
    processor: Arc<dyn CommandProcessor>,
    interval: Duration,
    active: AtomicBool,
    running: AtomicBool,
    state: Mutex<PollerState>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct DatabasePoller {
    shared: Arc<Shared>,
}

impl DatabasePoller {
    pub fn new(
        datastore: Arc<DataStore>,
        processor: Arc<dyn CommandProcessor>,
        interval: Duration,
    ) -> Self {
        tracing::info!(interval_secs = interval.as_secs_f64(), "poller initialized");
        Self {
            shared: Arc::new(Shared {
                datastore,
                processor,
                interval,
                active: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state: Mutex::new(PollerState::Idle),
                wake: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start polling. The first cycle begins immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) {
        self.shared.active.store(true, Ordering::SeqCst);

        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let shared = self.shared.clone();
            let handle = tokio::spawn(run_loop(shared));
            *self.shared.task.lock().unwrap() = Some(handle);
        } else {
            self.shared.wake.notify_one();
        }
        tracing::info!("poller activated");
    }

    /// Stop polling after the in-flight cycle, if any.
    pub fn deactivate(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        tracing::info!("poller deactivated");
    }

    pub fn toggle(&self) {
        if self.is_active() {
            self.deactivate();
        } else {
            self.activate();
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.lock().unwrap()
    }

    /// Run one claim-process-report cycle on the caller's task, regardless
    /// of activation.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.shared.run_cycle().await
    }

    /// Deactivate and wait for the loop task to finish its current cycle.
    pub async fn shutdown(&self) {
        self.deactivate();
        let handle = self.shared.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "poller task failed");
            }
        }
    }
}

/// Resets the loop flags if the loop task unwinds.
struct LoopGuard(Arc<Shared>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.running.store(false, Ordering::SeqCst);
            if let Ok(mut state) = self.0.state.lock() {
                *state = PollerState::Idle;
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let _guard = LoopGuard(shared.clone());
    loop {
        while shared.active.load(Ordering::SeqCst) {
            shared.run_cycle().await;

            if !shared.active.load(Ordering::SeqCst) {
                break;
            }
            shared.set_state(PollerState::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(shared.interval) => {}
                _ = shared.wake.notified() => {}
            }
        }

        shared.set_state(PollerState::Idle);
        shared.running.store(false, Ordering::SeqCst);

        // An activate() racing with this exit saw `running` still set and
        // only notified; pick the loop back up for it.
        if !shared.active.load(Ordering::SeqCst)
            || shared
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            break;
        }
    }
    tracing::debug!("poller loop exited");
}

impl Shared {
    fn set_state(&self, state: PollerState) {
        *self.state.lock().unwrap() = state;
    }

    async fn run_cycle(&self) -> CycleOutcome {
        self.set_state(PollerState::Claiming);
        tracing::debug!("polling store for command");

        let command = match self.datastore.poll_command().await {
            Ok(Some(ClaimedCommand::Ready(command))) => command,
            Ok(Some(ClaimedCommand::Malformed { id, error })) => {
                self.set_state(PollerState::Processing);
                let outcome = self.finish(id, CommandStatus::Error, Some(error)).await;
                self.set_state(PollerState::Waiting);
                return outcome;
            }
            Ok(None) => {
                self.set_state(PollerState::Waiting);
                return CycleOutcome::Empty;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to poll for commands");
                self.set_state(PollerState::Waiting);
                return CycleOutcome::StoreError(e.to_string());
            }
        };

        self.set_state(PollerState::Processing);
        tracing::info!(command_id = %command.id, kind = command.kind.type_name(), "command received");
        let (status, error) = self.process(&command).await;
        let outcome = self.finish(command.id, status, error).await;
        self.set_state(PollerState::Waiting);
        outcome
    }

    async fn process(&self, command: &Command) -> (CommandStatus, Option<String>) {
        let processor = self.processor.clone();
        let claimed = command.clone();
        let handled =
            tokio::spawn(async move { processor.handle_new_command(&claimed).await }).await;

        match handled {
            Ok(Ok(true)) => (CommandStatus::Completed, None),
            Ok(Ok(false)) => (
                CommandStatus::Error,
                Some(format!("Unsupported command type: {}", command.kind.type_name())),
            ),
            Ok(Err(e)) => (CommandStatus::Error, Some(format!("{:#}", e))),
            Err(e) => (CommandStatus::Error, Some(format!("Command handler aborted: {}", e))),
        }
    }

    /// Write the terminal status for `id`.
    async fn finish(&self, id: String, status: CommandStatus, error: Option<String>) -> CycleOutcome {
        if let Err(e) = self
            .datastore
            .update_command_status(&id, status, error.as_deref())
            .await
        {
            tracing::error!(command_id = %id, error = %e, "failed to update command status");
            return CycleOutcome::StatusNotRecorded {
                id,
                status,
                error: format!("{:#}", e),
            };
        }

        match error {
            None => {
                tracing::info!(command_id = %id, "command completed");
                CycleOutcome::Completed { id }
            }
            Some(error) => {
                tracing::warn!(command_id = %id, error = %error, "command failed");
                CycleOutcome::Failed { id, error }
            }
        }
    }
}
