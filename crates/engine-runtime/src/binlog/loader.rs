//! Replays dumped binlog segments on a target server, in sequence order and
//! one transaction at a time.

use super::dumper::read_json;
use crate::{
    actor::{ProgressHandle, Reporter, reporter::REPORT_INTERVAL},
    context::RunContext,
    error::BinlogError,
};
use connectors::{
    error::DbError,
    session::{Session, SessionFactory, recording::RecordingSessionFactory, variable},
    storage::{MemoryStorage, Storage},
};
use engine_config::options::{BinlogLoadOptions, Options};
use engine_core::progress::{JsonProgressStore, ProgressStore};
use engine_processing::binlog::{Transaction, binlog_statement, read_segment, transactions};
use model::{
    binlog::{BinlogEventKind, BinlogManifest, BinlogTask},
    core::gtid::{Gtid, GtidSet},
    dump::{
        files::{BINLOG_MANIFEST_FILE, binlog_progress_file},
        task::TaskStatus,
    },
    progress::state::{ProgressEntry, ProgressState},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogLoadReport {
    pub segments: u64,
    pub transactions: u64,
    /// Transactions the target already had.
    pub skipped: u64,
    pub statements: u64,
    pub last_gtid: Option<String>,
    /// Replay halted at a stop point.
    pub stopped: bool,
    pub dry_run_statements: Vec<String>,
    pub elapsed: Duration,
}

pub async fn load_binlogs(
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: BinlogLoadOptions,
) -> Result<BinlogLoadReport, BinlogError> {
    BinlogLoader::new(sessions, storage, options).run().await
}

pub struct BinlogLoader {
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: BinlogLoadOptions,
    cancel: CancellationToken,
}

/// Where replay has to halt.
#[derive(Debug, Clone, Default)]
struct StopPoints {
    before: Option<Gtid>,
    after: Option<Gtid>,
}

impl StopPoints {
    fn is_set(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }
}

impl BinlogLoader {
    pub fn new(sessions: Arc<dyn SessionFactory>, storage: Arc<dyn Storage>, options: BinlogLoadOptions) -> Self {
        Self {
            sessions,
            storage,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<BinlogLoadReport, BinlogError> {
        self.options.validate()?;
        let options = &self.options;
        let stops = StopPoints {
            before: options.stop_before()?,
            after: options.stop_after()?,
        };
        let run = RunContext::new("load-binlogs", self.storage.clone(), &options.storage);
        let storage = run.storage.clone();

        let Some(manifest) = read_json::<BinlogManifest>(storage.as_ref(), BINLOG_MANIFEST_FILE).await? else {
            return Err(BinlogError::NoBinlogDump(storage.describe()));
        };

        let recorder = options.dry_run.then(RecordingSessionFactory::new);
        let sessions: Arc<dyn SessionFactory> = match &recorder {
            Some(recorder) => Arc::new(recorder.clone()),
            None => self.sessions.clone(),
        };
        let session = sessions.open().await?;
        let mut applied: GtidSet = variable(session.as_ref(), "GLOBAL.gtid_executed")
            .await?
            .unwrap_or_default()
            .parse()?;
        let store: Arc<dyn ProgressStore> = match &recorder {
            Some(_) => Arc::new(JsonProgressStore::new(
                Arc::new(MemoryStorage::new(format!("dry-run-{}", run.run_id))),
                "binlog-load-progress.json",
            )),
            None => {
                let server_uuid = variable(session.as_ref(), "server_uuid").await?.unwrap_or_default();
                run.progress_store(&options.storage, &binlog_progress_file(&server_uuid))?
            }
        };
        let (progress, state, tracker) = ProgressHandle::start(store, options.reset_progress).await?;

        let mut segments = manifest.segments.clone();
        segments.sort_by_key(|s| s.sequence);
        let pending = self.pending(&segments, &state, &applied)?;
        info!(
            run_id = %run.run_id,
            segments = pending.len(),
            target = %applied,
            dry_run = options.dry_run,
            "Loading binlogs"
        );

        let reporter = Reporter::start("load-binlogs", run.metrics.clone(), REPORT_INTERVAL, options.show_progress);
        let mut replay = Replay {
            session: session.as_ref(),
            progress: &progress,
            stops: &stops,
            cancel: &self.cancel,
            applied: &mut applied,
            report: BinlogLoadReport::default(),
        };
        let mut result = Ok(());
        for segment in pending {
            if let Err(e) = replay.segment(storage.as_ref(), segment).await {
                result = Err(e);
                break;
            }
            run.metrics.increment_done();
            run.metrics.increment_bytes(segment.data_bytes, segment.file_bytes);
            if replay.report.stopped {
                break;
            }
        }
        let mut report = replay.report;
        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close session");
        }
        let flushed = progress.shutdown(tracker).await;
        reporter.finish().await;
        result?;
        flushed?;

        if stops.is_set() && !report.stopped {
            warn!("Stop point was never reached, every segment was applied");
            run.metrics.increment_warnings();
        }
        report.dry_run_statements = recorder.map(|r| r.statements()).unwrap_or_default();
        report.elapsed = run.metrics.snapshot().elapsed;
        info!(
            segments = report.segments,
            transactions = report.transactions,
            skipped = report.skipped,
            last_gtid = report.last_gtid.as_deref().unwrap_or(""),
            "Binlog load completed"
        );
        Ok(report)
    }

    /// Segments still to replay, once the chain has been checked for gaps.
    fn pending<'a>(
        &self,
        segments: &'a [BinlogTask],
        state: &ProgressState,
        applied: &GtidSet,
    ) -> Result<Vec<&'a BinlogTask>, BinlogError> {
        for pair in segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let prev_end: GtidSet = prev.gtid_end.parse()?;
            let next_start: GtidSet = next.gtid_start.parse()?;
            let next_end: GtidSet = next.gtid_end.parse()?;
            if !next_start.is_subset_of(&prev_end) || !prev_end.is_subset_of(&next_end) {
                let missing = prev_end.subtract(&next_start).union(&next_start.subtract(&prev_end));
                self.gap(next.sequence, &missing)?;
            }
        }

        let mut pending = Vec::new();
        for segment in segments {
            let end: GtidSet = segment.gtid_end.parse()?;
            if state.is_done(&segment.id) || (!end.is_empty() && end.is_subset_of(applied)) {
                debug!(sequence = segment.sequence, "Segment already applied");
                continue;
            }
            pending.push(segment);
        }

        if let Some(first) = pending.first() {
            let start: GtidSet = first.gtid_start.parse()?;
            if !start.is_subset_of(applied) {
                self.gap(first.sequence, &start.subtract(applied))?;
            }
        }
        Ok(pending)
    }

    fn gap(&self, sequence: u64, missing: &GtidSet) -> Result<(), BinlogError> {
        if self.options.ignore_gtid_gap || self.options.dry_run {
            warn!(sequence, %missing, "Ignoring GTID gap");
            return Ok(());
        }
        Err(BinlogError::GtidGap {
            sequence,
            missing: missing.to_string(),
        })
    }
}

struct Replay<'a> {
    session: &'a dyn Session,
    progress: &'a ProgressHandle,
    stops: &'a StopPoints,
    cancel: &'a CancellationToken,
    /// Target's executed set, grown as transactions are applied.
    applied: &'a mut GtidSet,
    report: BinlogLoadReport,
}

impl Replay<'_> {
    async fn segment(&mut self, storage: &dyn Storage, segment: &BinlogTask) -> Result<(), BinlogError> {
        self.progress.started(&segment.id).await?;
        match self.apply(storage, segment).await {
            Ok(count) => {
                let mut entry = if self.report.stopped {
                    ProgressEntry::new(segment.id.clone(), TaskStatus::InProgress)
                } else {
                    ProgressEntry::new(segment.id.clone(), TaskStatus::Done).with_counts(count, segment.data_bytes)
                };
                if let Some(gtid) = &self.report.last_gtid {
                    entry = entry.with_gtid(gtid.clone());
                }
                self.progress.record(entry).await?;
                self.report.segments += 1;
                info!(sequence = segment.sequence, transactions = count, "Binlog segment applied");
                Ok(())
            }
            Err(e) => {
                if !matches!(e, BinlogError::Cancelled) {
                    warn!(sequence = segment.sequence, error = %e, "Binlog segment failed");
                }
                self.progress.failed(&segment.id, &e).await?;
                Err(e)
            }
        }
    }

    /// Replays one segment and returns how many transactions it applied.
    async fn apply(&mut self, storage: &dyn Storage, segment: &BinlogTask) -> Result<u64, BinlogError> {
        let raw = storage.read(&segment.file).await?;
        let events = read_segment(&segment.file, &raw, segment.compression)?;
        let (format, groups) = transactions(events);

        if let Some(format) = format
            && groups.iter().any(has_row_events)
        {
            self.execute(&binlog_statement(&format.data)).await?;
        }

        let mut count = 0;
        for transaction in &groups {
            if self.cancel.is_cancelled() {
                return Err(BinlogError::Cancelled);
            }
            let gtid = transaction.gtid.as_deref().map(str::parse::<Gtid>).transpose()?;
            if let Some(gtid) = &gtid
                && self.stops.before.as_ref() == Some(gtid)
            {
                info!(%gtid, "Stopping before transaction");
                self.report.stopped = true;
                break;
            }

            match &gtid {
                Some(gtid) if self.applied.contains(gtid) => {
                    self.report.skipped += 1;
                }
                _ => {
                    self.replay(transaction).await?;
                    count += 1;
                    if let Some(gtid) = &gtid {
                        self.applied.add(gtid);
                        self.report.last_gtid = Some(gtid.to_string());
                    }
                }
            }

            if let Some(gtid) = &gtid
                && self.stops.after.as_ref() == Some(gtid)
            {
                info!(%gtid, "Stopping after transaction");
                self.report.stopped = true;
                break;
            }
        }
        self.report.transactions += count;
        Ok(count)
    }

    async fn replay(&mut self, transaction: &Transaction) -> Result<(), BinlogError> {
        let statements = transaction.statements();
        for statement in &statements {
            if let Err(e) = self.execute(statement).await {
                // Leave the session usable for nothing but a clean report.
                for cleanup in ["ROLLBACK", "SET GTID_NEXT='AUTOMATIC'"] {
                    if let Err(e) = self.session.execute(cleanup).await {
                        debug!(error = %e, "Cleanup after failed transaction failed");
                    }
                }
                return Err(e);
            }
        }
        self.report.statements += statements.len() as u64;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<(), BinlogError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BinlogError::Cancelled),
            result = self.session.execute(sql) => result.map(|_| ()).map_err(|e: DbError| e.into()),
        }
    }
}

fn has_row_events(transaction: &Transaction) -> bool {
    transaction
        .events
        .iter()
        .any(|e| matches!(e.kind, BinlogEventKind::TableMap | BinlogEventKind::Rows | BinlogEventKind::Other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{
        dumper::{
            dump_binlogs,
            tests::{UUID, binlog_file, source},
        },
        source::MemoryBinlogSource,
    };
    use connectors::session::{QueryResult, Row};
    use engine_config::options::BinlogDumpOptions;
    use model::core::identifiers::TaskId;

    /// Binlogs of transactions 3 and 4, continuing a dump taken at 1-2.
    async fn dumped() -> MemoryStorage {
        let storage = MemoryStorage::new("binlogs");
        let base = BinlogDumpOptions {
            since: Some(format!("{UUID}:1-2")),
            show_progress: false,
            ..Default::default()
        };
        dump_binlogs(Arc::new(source()), Arc::new(storage.clone()), base)
            .await
            .unwrap();
        storage
    }

    fn target(gtid_executed: &str) -> RecordingSessionFactory {
        let gtid_executed = gtid_executed.to_string();
        RecordingSessionFactory::with_responder(move |sql| match sql {
            "SELECT @@GLOBAL.gtid_executed" => Some(Ok(QueryResult::with_rows(
                &["gtid"],
                vec![Row::from_strs(&[Some(gtid_executed.as_str())])],
            ))),
            "SELECT @@server_uuid" => Some(Ok(QueryResult::with_rows(
                &["uuid"],
                vec![Row::from_strs(&[Some("target-uuid")])],
            ))),
            _ => None,
        })
    }

    fn options() -> BinlogLoadOptions {
        BinlogLoadOptions {
            show_progress: false,
            ..Default::default()
        }
    }

    fn replayed(statements: &[String]) -> Vec<String> {
        statements
            .iter()
            .filter(|s| !s.starts_with("SELECT @@"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn replays_transactions_in_order() {
        let storage = dumped().await;
        let target = target(&format!("{UUID}:1-2"));

        let report = load_binlogs(Arc::new(target.clone()), Arc::new(storage.clone()), options())
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(report.transactions, 2);
        assert_eq!(report.last_gtid, Some(format!("{UUID}:4")));

        assert_eq!(
            replayed(&target.statements()),
            vec![
                format!("SET GTID_NEXT='{UUID}:3'"),
                "BEGIN".to_string(),
                "UPDATE t SET a = 3".to_string(),
                "COMMIT".to_string(),
                "SET GTID_NEXT='AUTOMATIC'".to_string(),
                format!("SET GTID_NEXT='{UUID}:4'"),
                "BEGIN".to_string(),
                "DELETE FROM t WHERE a = 1".to_string(),
                "COMMIT".to_string(),
                "SET GTID_NEXT='AUTOMATIC'".to_string(),
            ]
        );
        assert!(storage.exists(&binlog_progress_file("target-uuid")).await.unwrap());
    }

    #[tokio::test]
    async fn transactions_in_the_target_are_skipped() {
        let storage = dumped().await;
        let target = target(&format!("{UUID}:1-3"));

        let report = load_binlogs(Arc::new(target.clone()), Arc::new(storage), options())
            .await
            .unwrap();
        assert_eq!(report.segments, 1);
        assert_eq!(report.transactions, 1);
        assert!(!target.statements().iter().any(|s| s.contains("UPDATE t SET a = 3")));
    }

    #[tokio::test]
    async fn target_behind_the_dump_is_a_gap() {
        let storage = dumped().await;

        let err = load_binlogs(Arc::new(target(&format!("{UUID}:1"))), Arc::new(storage.clone()), options())
            .await
            .unwrap_err();
        assert!(matches!(err, BinlogError::GtidGap { sequence: 1, ref missing } if *missing == format!("{UUID}:2")));

        let forced = BinlogLoadOptions {
            ignore_gtid_gap: true,
            ..options()
        };
        let report = load_binlogs(Arc::new(target(&format!("{UUID}:1"))), Arc::new(storage), forced)
            .await
            .unwrap();
        assert_eq!(report.transactions, 2);
    }

    #[tokio::test]
    async fn missing_segment_breaks_the_chain() {
        let storage = dumped().await;
        let grown = source().with_file(
            "binlog.000003",
            binlog_file(&format!("{UUID}:1-4"), &[(5, "INSERT INTO t VALUES (5)")]),
        );
        let dump_options = BinlogDumpOptions {
            show_progress: false,
            ..Default::default()
        };
        dump_binlogs(Arc::new(grown), Arc::new(storage.clone()), dump_options)
            .await
            .unwrap();

        let mut manifest: BinlogManifest =
            serde_json::from_slice(&storage.read(BINLOG_MANIFEST_FILE).await.unwrap()).unwrap();
        manifest.segments.retain(|s| s.sequence != 2);
        storage
            .write(BINLOG_MANIFEST_FILE, &serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();

        let err = load_binlogs(Arc::new(target(&format!("{UUID}:1-2"))), Arc::new(storage), options())
            .await
            .unwrap_err();
        assert!(matches!(err, BinlogError::GtidGap { sequence: 3, .. }));
    }

    #[tokio::test]
    async fn stops_before_and_after_a_transaction() {
        let storage = dumped().await;
        let target_before = target(&format!("{UUID}:1-2"));
        let report = load_binlogs(
            Arc::new(target_before.clone()),
            Arc::new(storage.clone()),
            BinlogLoadOptions {
                stop_before: Some(format!("{UUID}:4")),
                ..options()
            },
        )
        .await
        .unwrap();
        assert!(report.stopped);
        assert_eq!(report.last_gtid, Some(format!("{UUID}:3")));
        assert!(!target_before.statements().iter().any(|s| s.contains("DELETE")));

        let progress = JsonProgressStore::new(Arc::new(storage), binlog_progress_file("target-uuid"))
            .load()
            .await
            .unwrap();
        assert_eq!(progress.status(&TaskId::binlog(1, "binlog.000001")), TaskStatus::Done);
        assert_eq!(progress.status(&TaskId::binlog(2, "binlog.000002")), TaskStatus::InProgress);

        let storage = dumped().await;
        let target_after = target(&format!("{UUID}:1-2"));
        let report = load_binlogs(
            Arc::new(target_after.clone()),
            Arc::new(storage),
            BinlogLoadOptions {
                stop_after: Some(format!("{UUID}:3")),
                ..options()
            },
        )
        .await
        .unwrap();
        assert!(report.stopped);
        assert_eq!(report.transactions, 1);
        assert_eq!(
            replayed(&target_before.statements()),
            replayed(&target_after.statements())
        );
    }

    #[tokio::test]
    async fn dry_run_only_records() {
        let storage = dumped().await;
        let target = target(&format!("{UUID}:1-2"));
        let report = load_binlogs(
            Arc::new(target.clone()),
            Arc::new(storage.clone()),
            BinlogLoadOptions {
                dry_run: true,
                ..options()
            },
        )
        .await
        .unwrap();
        assert!(target.statements().is_empty());
        assert!(report.dry_run_statements.contains(&"UPDATE t SET a = 3".to_string()));
        assert!(!storage.exists(&binlog_progress_file("target-uuid")).await.unwrap());
    }

    #[tokio::test]
    async fn needs_a_binlog_dump() {
        let err = load_binlogs(Arc::new(target("")), Arc::new(MemoryStorage::new("empty")), options())
            .await
            .unwrap_err();
        assert!(matches!(err, BinlogError::NoBinlogDump(_)));
    }

    #[tokio::test]
    async fn statement_only_source_needs_no_format_event() {
        let storage = MemoryStorage::new("binlogs");
        let source = MemoryBinlogSource::new("source-uuid").with_file(
            "binlog.000001",
            binlog_file("", &[(1, "INSERT INTO t VALUES (1)")]),
        );
        let since = BinlogDumpOptions {
            since: Some("binlog.000001:4".into()),
            show_progress: false,
            ..Default::default()
        };
        dump_binlogs(Arc::new(source), Arc::new(storage.clone()), since)
            .await
            .unwrap();

        let target = target("");
        load_binlogs(Arc::new(target.clone()), Arc::new(storage), options())
            .await
            .unwrap();
        assert!(!target.statements().iter().any(|s| s.starts_with("BINLOG")));
    }
}
