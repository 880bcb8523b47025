//! Extends a dump with the binary logs written after it. Events are cut into
//! compressed segments that never span two source files; the binlog manifest
//! is rewritten after every segment, so an interrupted run loses at most the
//! segment it was writing.

use super::source::BinlogSource;
use crate::{
    actor::{Reporter, reporter::REPORT_INTERVAL},
    context::RunContext,
    error::BinlogError,
};
use chrono::Utc;
use connectors::storage::{Storage, StorageRegistry};
use engine_config::{
    error::ConfigError,
    options::{BinlogDumpOptions, BinlogStart, Options},
};
use engine_core::metrics::Metrics;
use engine_processing::binlog::SegmentWriter;
use model::{
    binlog::{BinlogBase, BinlogEvent, BinlogEventKind, BinlogManifest, BinlogPosition, BinlogTask},
    core::{
        gtid::{Gtid, GtidSet},
        identifiers::TaskId,
    },
    dump::{
        files::{BINLOG_MANIFEST_FILE, MANIFEST_FILE, binlog_segment_file, binlog_segment_meta_file},
        manifest::{DumpManifest, FORMAT_VERSION},
        task::TaskStatus,
    },
};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events requested from the source per round trip.
const READ_BATCH: usize = 1000;
/// Every binary log starts with a 4 byte magic number.
const FIRST_EVENT: u64 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogDumpReport {
    pub segments: u64,
    pub events: u64,
    pub transactions: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
    /// DDL statements dumped because `ignore_ddl_changes` was set.
    pub ignored_ddl: u64,
    pub gtid_end: String,
    pub end_position: Option<BinlogPosition>,
    pub elapsed: Duration,
}

pub async fn dump_binlogs(
    source: Arc<dyn BinlogSource>,
    storage: Arc<dyn Storage>,
    options: BinlogDumpOptions,
) -> Result<BinlogDumpReport, BinlogError> {
    BinlogDumper::new(source, storage, options).run().await
}

pub struct BinlogDumper {
    source: Arc<dyn BinlogSource>,
    storage: Arc<dyn Storage>,
    options: BinlogDumpOptions,
    cancel: CancellationToken,
}

impl BinlogDumper {
    pub fn new(source: Arc<dyn BinlogSource>, storage: Arc<dyn Storage>, options: BinlogDumpOptions) -> Self {
        Self {
            source,
            storage,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<BinlogDumpReport, BinlogError> {
        self.options.validate()?;
        let options = &self.options;
        let run = RunContext::new("dump-binlogs", self.storage.clone(), &options.storage);
        let storage = run.storage.clone();
        let server_uuid = self.source.server_uuid().await?;

        let manifest = match read_json::<BinlogManifest>(storage.as_ref(), BINLOG_MANIFEST_FILE).await? {
            Some(manifest) => {
                if options.since.is_some() {
                    return Err(ConfigError::invalid(
                        "since",
                        "the output location already holds binary logs, which are continued",
                    )
                    .into());
                }
                same_server(&manifest.server_uuid, &server_uuid)?;
                info!(
                    segments = manifest.segments.len(),
                    gtid_end = %manifest.gtid_end,
                    "Continuing binlog dump"
                );
                manifest
            }
            None => {
                let base = self.base(&storage, &server_uuid).await?;
                info!(origin = %base.origin, gtid_executed = %base.gtid_executed, "Starting binlog dump");
                let now = Utc::now();
                BinlogManifest {
                    version: FORMAT_VERSION.to_string(),
                    server_uuid: server_uuid.clone(),
                    server_version: self.source.server_version().await?,
                    gtid_end: base.gtid_executed.clone(),
                    end_position: base.position.clone(),
                    base,
                    segments: Vec::new(),
                    created: now,
                    updated: now,
                }
            }
        };

        let end = self.source.coordinates().await?;
        let end_position = end
            .binlog
            .ok_or_else(|| BinlogError::Source("binary logging is disabled on the source".into()))?;
        let covered: GtidSet = manifest.gtid_end.parse()?;
        let start_position = manifest.end_position.clone();
        let files = self.source.files().await?;
        let first = match &start_position {
            Some(position) => files
                .iter()
                .position(|f| *f == position.file)
                .ok_or_else(|| BinlogError::Source(format!("binary log {} is no longer available", position.file)))?,
            None => self.locate(&files, &covered).await?,
        };
        let last = files
            .iter()
            .position(|f| *f == end_position.file)
            .ok_or_else(|| BinlogError::Source(format!("binary log {} is not listed", end_position.file)))?;
        debug!(from = ?start_position, to = %end_position, first = %files[first], "Binlog range");

        let reporter = Reporter::start("dump-binlogs", run.metrics.clone(), REPORT_INTERVAL, options.show_progress);
        let mut stream = SegmentStream {
            storage: storage.as_ref(),
            options,
            metrics: &run.metrics,
            gtids: covered.clone(),
            covered,
            manifest,
            format: None,
            segment: None,
            skipping: false,
            position: start_position.clone(),
            report: BinlogDumpReport::default(),
        };
        let result = self
            .stream(&mut stream, &files, first, last, start_position.as_ref(), &end_position)
            .await;
        reporter.finish().await;
        result?;

        let mut report = stream.report;
        report.gtid_end = stream.manifest.gtid_end.clone();
        report.end_position = stream.manifest.end_position.clone();
        report.elapsed = run.metrics.snapshot().elapsed;
        info!(
            segments = report.segments,
            transactions = report.transactions,
            gtid_end = %report.gtid_end,
            "Binlog dump completed"
        );
        Ok(report)
    }

    async fn stream(
        &self,
        stream: &mut SegmentStream<'_>,
        files: &[String],
        first: usize,
        last: usize,
        start: Option<&BinlogPosition>,
        end: &BinlogPosition,
    ) -> Result<(), BinlogError> {
        for (index, file) in files.iter().enumerate().take(last + 1).skip(first) {
            let mut from = match start {
                Some(position) if index == first => position.position,
                _ => FIRST_EVENT,
            };
            stream.format = None;
            if from > FIRST_EVENT {
                // Row events can only be replayed after the format
                // description that opens their file.
                stream.format = self
                    .source
                    .read(file, FIRST_EVENT, 1)
                    .await?
                    .into_iter()
                    .find(|e| e.kind == BinlogEventKind::FormatDescription);
            }

            'file: loop {
                if self.cancel.is_cancelled() {
                    return Err(BinlogError::Cancelled);
                }
                let batch = self.source.read(file, from, READ_BATCH).await?;
                if batch.is_empty() {
                    break;
                }
                for event in batch {
                    if *file == end.file && event.position >= end.position {
                        break 'file;
                    }
                    from = event.end_position;
                    stream.event(event).await?;
                }
            }
            stream.close().await?;
        }
        stream.finish().await
    }

    /// Where the dump starts when it is not continuing binlogs in the output
    /// location.
    async fn base(&self, storage: &Arc<dyn Storage>, server_uuid: &str) -> Result<BinlogBase, BinlogError> {
        match self.options.start()? {
            Some(BinlogStart::Position(position)) => {
                return Ok(BinlogBase {
                    gtid_executed: String::new(),
                    position: Some(position),
                    origin: "since".into(),
                });
            }
            Some(BinlogStart::Gtids(set)) => {
                return Ok(BinlogBase {
                    gtid_executed: set.to_string(),
                    position: None,
                    origin: "since".into(),
                });
            }
            None => {}
        }

        let (prior, origin): (Arc<dyn Storage>, String) = match &self.options.start_from {
            Some(url) => (StorageRegistry::new().open(url).await?, url.clone()),
            None => (storage.clone(), storage.describe()),
        };
        if let Some(binlogs) = read_json::<BinlogManifest>(prior.as_ref(), BINLOG_MANIFEST_FILE).await? {
            same_server(&binlogs.server_uuid, server_uuid)?;
            return Ok(BinlogBase {
                gtid_executed: binlogs.gtid_end,
                position: binlogs.end_position,
                origin,
            });
        }
        let Some(dump) = read_json::<DumpManifest>(prior.as_ref(), MANIFEST_FILE).await? else {
            return Err(BinlogError::NoStartPoint);
        };
        same_server(&dump.server_uuid, server_uuid)?;
        if !dump.complete {
            warn!(origin = %origin, "Continuing from a dump that did not complete");
        }
        let position = dump.binlog_file.zip(dump.binlog_position).map(|(file, position)| BinlogPosition {
            file,
            position,
        });
        Ok(BinlogBase {
            gtid_executed: dump.gtid_executed,
            position,
            origin,
        })
    }

    /// The newest file whose preceding transactions are all covered. Files
    /// that don't report their previous GTIDs are read from the oldest one.
    async fn locate(&self, files: &[String], covered: &GtidSet) -> Result<usize, BinlogError> {
        let mut first = 0;
        for (index, file) in files.iter().enumerate() {
            let head = self.source.read(file, FIRST_EVENT, 2).await?;
            let Some(previous) = head
                .iter()
                .find(|e| e.kind == BinlogEventKind::PreviousGtids)
                .and_then(|e| e.statement.as_deref())
            else {
                break;
            };
            let previous: GtidSet = previous.parse()?;
            if !previous.is_subset_of(covered) {
                if index == 0 {
                    return Err(BinlogError::Source(format!(
                        "transactions {} were purged from the source",
                        previous.subtract(covered)
                    )));
                }
                break;
            }
            first = index;
        }
        Ok(first)
    }
}

fn same_server(expected: &str, found: &str) -> Result<(), BinlogError> {
    if !expected.is_empty() && !expected.eq_ignore_ascii_case(found) {
        return Err(BinlogError::ServerMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

pub(super) async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, file: &str) -> Result<Option<T>, BinlogError> {
    if !storage.exists(file).await? {
        return Ok(None);
    }
    let data = storage.read(file).await?;
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| BinlogError::Metadata {
            file: file.to_string(),
            source,
        })
}

struct OpenSegment {
    writer: SegmentWriter,
    sequence: u64,
    source_file: String,
    basename: String,
    start_position: u64,
    end_position: u64,
    gtid_start: String,
}

/// Cuts the event stream into segments and records each one.
struct SegmentStream<'a> {
    storage: &'a dyn Storage,
    options: &'a BinlogDumpOptions,
    metrics: &'a Metrics,
    manifest: BinlogManifest,
    /// Transactions the continued dump already holds.
    covered: GtidSet,
    /// Everything dumped so far, `covered` included.
    gtids: GtidSet,
    format: Option<BinlogEvent>,
    segment: Option<OpenSegment>,
    /// Inside a transaction that is already covered.
    skipping: bool,
    position: Option<BinlogPosition>,
    report: BinlogDumpReport,
}

impl SegmentStream<'_> {
    async fn event(&mut self, event: BinlogEvent) -> Result<(), BinlogError> {
        self.position = Some(BinlogPosition {
            file: event.file.clone(),
            position: event.end_position,
        });
        match event.kind {
            BinlogEventKind::FormatDescription => {
                self.format = Some(event);
                return Ok(());
            }
            BinlogEventKind::PreviousGtids | BinlogEventKind::Rotate => return Ok(()),
            BinlogEventKind::Gtid => {
                let gtid: Gtid = event.gtid.as_deref().unwrap_or_default().parse()?;
                self.skipping = self.covered.contains(&gtid);
                if self.skipping {
                    return Ok(());
                }
                if self
                    .segment
                    .as_ref()
                    .is_some_and(|s| s.writer.data_bytes() >= self.options.max_segment_bytes)
                {
                    self.close().await?;
                }
                self.open(&event)?;
                self.gtids.add(&gtid);
                self.report.transactions += 1;
            }
            _ if self.skipping => return Ok(()),
            _ if event.is_ddl() => {
                let position = format!("{}:{}", event.file, event.position);
                let statement = event.statement.clone().unwrap_or_default();
                if !self.options.ignore_ddl_changes {
                    return Err(BinlogError::DdlInRange { position, statement });
                }
                warn!(%position, statement, "Dumping DDL found in the binary log");
                self.metrics.increment_warnings();
                self.report.ignored_ddl += 1;
            }
            _ => {}
        }
        self.push(&event)
    }

    fn open(&mut self, event: &BinlogEvent) -> Result<(), BinlogError> {
        if self.segment.is_some() {
            return Ok(());
        }
        let sequence = self.manifest.next_sequence();
        let basename = event
            .file
            .rsplit_once('.')
            .map(|(base, _)| base)
            .unwrap_or(&event.file)
            .to_string();
        let file = binlog_segment_file(&basename, sequence, self.options.compression);
        let mut writer = SegmentWriter::new(file, self.options.compression)?;
        if let Some(format) = &self.format {
            writer.push(format)?;
        }
        self.segment = Some(OpenSegment {
            writer,
            sequence,
            source_file: event.file.clone(),
            basename,
            start_position: event.position,
            end_position: event.end_position,
            gtid_start: self.gtids.to_string(),
        });
        Ok(())
    }

    fn push(&mut self, event: &BinlogEvent) -> Result<(), BinlogError> {
        self.open(event)?;
        if let Some(segment) = &mut self.segment {
            segment.writer.push(event)?;
            segment.end_position = event.end_position;
        }
        self.report.events += 1;
        Ok(())
    }

    /// Writes the open segment and records it in the manifest.
    async fn close(&mut self) -> Result<(), BinlogError> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let event_count = segment.writer.events();
        let data_bytes = segment.writer.data_bytes();
        let file = segment.writer.file().to_string();
        let bytes = segment.writer.finish()?;
        let task = BinlogTask {
            id: TaskId::binlog(segment.sequence, &segment.source_file),
            sequence: segment.sequence,
            source_file: segment.source_file.clone(),
            basename: segment.basename,
            file,
            start_position: segment.start_position,
            end_position: segment.end_position,
            gtid_start: segment.gtid_start,
            gtid_end: self.gtids.to_string(),
            event_count,
            data_bytes,
            file_bytes: bytes.len() as u64,
            compression: self.options.compression,
            status: TaskStatus::Done,
        };
        if self.options.dry_run {
            debug!(sequence = task.sequence, file = %task.file, events = event_count, "Would write binlog segment");
        } else {
            self.storage.write(&task.file, &bytes).await?;
            self.storage
                .write(
                    &binlog_segment_meta_file(&task.basename, task.sequence),
                    &serde_json::to_vec_pretty(&task)?,
                )
                .await?;
            info!(sequence = task.sequence, file = %task.file, events = event_count, "Binlog segment written");
        }

        self.metrics.increment_rows(event_count);
        self.metrics.increment_bytes(data_bytes, task.file_bytes);
        self.metrics.increment_done();
        self.report.segments += 1;
        self.report.data_bytes += data_bytes;
        self.report.file_bytes += task.file_bytes;

        self.manifest.gtid_end = task.gtid_end.clone();
        self.manifest.end_position = Some(BinlogPosition {
            file: segment.source_file,
            position: task.end_position,
        });
        self.manifest.segments.push(task);
        self.write_manifest().await
    }

    /// Closes the last segment and moves the manifest's end up to the last
    /// event read, covered or not.
    async fn finish(&mut self) -> Result<(), BinlogError> {
        self.close().await?;
        self.manifest.gtid_end = self.gtids.to_string();
        if let Some(position) = &self.position {
            self.manifest.end_position = Some(position.clone());
        }
        self.write_manifest().await
    }

    async fn write_manifest(&mut self) -> Result<(), BinlogError> {
        if self.options.dry_run {
            return Ok(());
        }
        self.manifest.updated = Utc::now();
        self.storage
            .write(BINLOG_MANIFEST_FILE, &serde_json::to_vec_pretty(&self.manifest)?)
            .await?;
        Ok(())
    }
}
