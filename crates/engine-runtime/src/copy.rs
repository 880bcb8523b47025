//! Server to server copy: a dump into process memory and a load reading it
//! back, running side by side. Nothing is written to durable storage.

use crate::{
    dump::{DumpReport, Dumper},
    error::{CopyError, DumpError},
    load::{LoadReport, Loader},
};
use connectors::{session::SessionFactory, storage::MemoryStorage};
use engine_config::options::{CopyOptions, DumpScope, Options};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub dump: DumpReport,
    pub load: LoadReport,
}

pub async fn copy_instance(
    source: Arc<dyn SessionFactory>,
    target: Arc<dyn SessionFactory>,
    options: CopyOptions,
) -> Result<CopyReport, CopyError> {
    Copier::new(source, target, options).run(&DumpScope::Instance).await
}

pub async fn copy_schemas(
    source: Arc<dyn SessionFactory>,
    target: Arc<dyn SessionFactory>,
    schemas: Vec<String>,
    options: CopyOptions,
) -> Result<CopyReport, CopyError> {
    Copier::new(source, target, options)
        .run(&DumpScope::Schemas(schemas))
        .await
}

pub async fn copy_tables(
    source: Arc<dyn SessionFactory>,
    target: Arc<dyn SessionFactory>,
    schema: String,
    tables: Vec<String>,
    all: bool,
    options: CopyOptions,
) -> Result<CopyReport, CopyError> {
    Copier::new(source, target, options)
        .run(&DumpScope::Tables { schema, tables, all })
        .await
}

pub struct Copier {
    source: Arc<dyn SessionFactory>,
    target: Arc<dyn SessionFactory>,
    options: CopyOptions,
    cancel: CancellationToken,
}

impl Copier {
    pub fn new(source: Arc<dyn SessionFactory>, target: Arc<dyn SessionFactory>, options: CopyOptions) -> Self {
        Self {
            source,
            target,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A failure on either side cancels the other one; the error reported is
    /// the one that caused the cancellation.
    pub async fn run(&self, scope: &DumpScope) -> Result<CopyReport, CopyError> {
        self.options.validate()?;
        scope.validate()?;

        let storage = Arc::new(MemoryStorage::new(format!("copy-{}", Uuid::new_v4())));
        let dump_cancel = self.cancel.child_token();
        let load_cancel = self.cancel.child_token();
        let dumper = Dumper::new(self.source.clone(), storage.clone(), self.options.effective_dump())
            .with_cancel(dump_cancel.clone());
        let loader = Loader::new(self.target.clone(), storage, self.options.effective_load())
            .with_cancel(load_cancel.clone());
        info!(dry_run = self.options.dump.dry_run || self.options.load.dry_run, "Copying");

        let dump = async {
            let result = dumper.run(scope).await;
            if let Err(e) = &result {
                warn!(error = %e, "Dump side of the copy failed, stopping the load");
                load_cancel.cancel();
            }
            result
        };
        let load = async {
            let result = loader.run().await;
            if let Err(e) = &result {
                warn!(error = %e, "Load side of the copy failed, stopping the dump");
                dump_cancel.cancel();
            }
            result
        };

        match tokio::join!(dump, load) {
            (Ok(dump), Ok(load)) => {
                info!(tables = load.tables, rows = load.rows, "Copy completed");
                Ok(CopyReport { dump, load })
            }
            (Err(DumpError::Cancelled), Err(e)) | (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::{error::DbError, session::recording::RecordingSessionFactory};
    use engine_config::options::LoadOptions;

    fn options() -> CopyOptions {
        let mut options = CopyOptions::default();
        options.dump.show_progress = false;
        options.load = LoadOptions {
            show_progress: false,
            ..Default::default()
        };
        options
    }

    #[tokio::test]
    async fn failed_dump_stops_the_waiting_load() {
        let source = RecordingSessionFactory::with_responder(|_| Some(Err(DbError::server(1045, "Access denied"))));
        let target = RecordingSessionFactory::new();

        let err = copy_instance(Arc::new(source), Arc::new(target.clone()), options())
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Dump(_)));
        assert!(target.statements().iter().all(|s| !s.starts_with("CREATE")));
    }

    #[tokio::test]
    async fn load_timeout_is_managed_by_the_copy() {
        let mut options = options();
        options.load.wait_dump_timeout = Some(10.0);
        let err = copy_instance(
            Arc::new(RecordingSessionFactory::new()),
            Arc::new(RecordingSessionFactory::new()),
            options,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }

    #[tokio::test]
    async fn empty_table_list_is_rejected() {
        let err = copy_tables(
            Arc::new(RecordingSessionFactory::new()),
            Arc::new(RecordingSessionFactory::new()),
            "app".into(),
            Vec::new(),
            false,
            options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }
}
