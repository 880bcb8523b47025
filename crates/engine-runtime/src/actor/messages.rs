use engine_core::error::ProgressError;
use model::progress::state::{ProgressEntry, ProgressState};
use tokio::sync::oneshot;

/// Messages for the progress tracker.
///
/// The tracker is the only writer of the progress log, so transitions from
/// all workers are applied in the order they arrive.
#[derive(Debug)]
pub enum ProgressMsg {
    /// Apply one status transition and persist it.
    Record(ProgressEntry),

    /// Reply once everything sent before has been persisted, with the first
    /// persistence failure if any.
    Flush(oneshot::Sender<Result<(), ProgressError>>),

    /// Reply with a copy of the folded state.
    Snapshot(oneshot::Sender<ProgressState>),
}

/// Messages for the progress reporter.
#[derive(Debug)]
pub enum ReporterMsg {
    /// Log current throughput.
    Tick,

    /// Total bytes the run is expected to move, once it is known.
    SetTotal(u64),
}
