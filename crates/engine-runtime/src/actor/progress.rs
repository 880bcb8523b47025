use crate::{
    actor::{Actor, ActorContext, ActorRef, messages::ProgressMsg, spawn_actor},
    error::ActorError,
};
use async_trait::async_trait;
use engine_core::{error::ProgressError, progress::ProgressStore};
use model::{
    core::identifiers::TaskId,
    dump::task::TaskStatus,
    progress::state::{ProgressEntry, ProgressState},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const MAILBOX: usize = 1024;

/// Owns the progress log of one run.
struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    state: ProgressState,
    failure: Option<ProgressError>,
}

#[async_trait]
impl Actor<ProgressMsg> for ProgressTracker {
    async fn on_start(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        debug!(actor = ctx.name(), store = %self.store.describe(), tasks = self.state.len(), "Progress tracker started");
        Ok(())
    }

    async fn handle(&mut self, msg: ProgressMsg, _ctx: &ActorContext) -> Result<(), ActorError> {
        match msg {
            ProgressMsg::Record(entry) => {
                self.state.apply(&entry);
                if let Err(e) = self.store.append(&entry).await {
                    warn!(task = %entry.id, error = %e, "Failed to persist progress");
                    self.failure.get_or_insert(e);
                }
            }
            ProgressMsg::Flush(reply) => {
                let result = match self.failure.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            ProgressMsg::Snapshot(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
        Ok(())
    }
}

/// Cloneable front of the progress tracker, handed to every worker.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    actor: ActorRef<ProgressMsg>,
}

impl ProgressHandle {
    /// Loads the existing log (after discarding it when `reset` is set) and
    /// starts the tracker. Returns the state found at start.
    pub async fn start(
        store: Arc<dyn ProgressStore>,
        reset: bool,
    ) -> Result<(Self, ProgressState, JoinHandle<()>), ProgressError> {
        if reset {
            store.reset().await?;
        }
        let state = store.load().await?;
        let tracker = ProgressTracker {
            store,
            state: state.clone(),
            failure: None,
        };
        let (actor, handle) = spawn_actor("progress", MAILBOX, tracker);
        Ok((Self { actor }, state, handle))
    }

    pub async fn record(&self, entry: ProgressEntry) -> Result<(), ProgressError> {
        self.actor
            .send(ProgressMsg::Record(entry))
            .await
            .map_err(|_| ProgressError::Closed)
    }

    pub async fn started(&self, id: &TaskId) -> Result<(), ProgressError> {
        self.record(ProgressEntry::new(id.clone(), TaskStatus::InProgress))
            .await
    }

    pub async fn done(&self, id: &TaskId, rows: u64, bytes: u64) -> Result<(), ProgressError> {
        self.record(ProgressEntry::new(id.clone(), TaskStatus::Done).with_counts(rows, bytes))
            .await
    }

    pub async fn failed(&self, id: &TaskId, error: impl ToString) -> Result<(), ProgressError> {
        self.record(ProgressEntry::new(id.clone(), TaskStatus::Failed).with_error(error.to_string()))
            .await
    }

    pub async fn flush(&self) -> Result<(), ProgressError> {
        self.actor
            .ask(ProgressMsg::Flush)
            .await
            .map_err(|_| ProgressError::Closed)?
    }

    /// Flushes, releases this handle and waits for the tracker to stop. Every
    /// other clone must be gone already. A tracker that died loses entries,
    /// so that is reported even when the flush got an answer.
    pub async fn shutdown(self, tracker: JoinHandle<()>) -> Result<(), ProgressError> {
        let flushed = self.flush().await;
        drop(self);
        if let Err(e) = tracker.await {
            error!(error = %e, "Progress tracker stopped abnormally");
            return Err(ProgressError::TrackerFailed(e.to_string()));
        }
        flushed
    }

    pub async fn state(&self) -> Result<ProgressState, ProgressError> {
        self.actor
            .ask(ProgressMsg::Snapshot)
            .await
            .map_err(|_| ProgressError::Closed)
    }
}
