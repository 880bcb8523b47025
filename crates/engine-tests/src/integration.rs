#[cfg(test)]
mod tests {
    use crate::{
        server::AVG_ROW_LENGTH,
        utils::{
            FlakyStorage, assert_dump_complete, assert_same_rows, count_statements, data_files, dump_options,
            load_options, shared, source_server, target_server,
        },
    };
    use connectors::storage::{MemoryStorage, Storage};
    use engine_config::settings::chunking::MIN_BYTES_PER_CHUNK;
    use engine_runtime::{
        dump::{dump_instance, dump_schemas, dump_tables},
        error::{DumpError, LoadError},
        load::load_dump,
    };
    use model::dump::{
        files::{DONE_FILE, MANIFEST_FILE},
        manifest::TableManifest,
    };
    use std::sync::Arc;
    use tracing_test::traced_test;

    // Scenario: an instance is dumped into memory and loaded into an empty server.
    // Expected Outcome:
    // - Every row arrives unchanged, including quotes, tabs, newlines and NULLs.
    // - The empty table is created without data.
    // - System schemas are left out.
    #[traced_test]
    #[tokio::test]
    async fn dump_then_load_reproduces_every_row() {
        let source = source_server(1000);
        let target = target_server();
        let storage = MemoryStorage::new("round-trip");

        let dumped = dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(2, MIN_BYTES_PER_CHUNK))
            .await
            .unwrap();
        assert_eq!(dumped.tables, 2);
        assert_eq!(dumped.rows, 1000);
        assert_dump_complete(&storage).await;

        let loaded = load_dump(Arc::new(target.clone()), shared(&storage), load_options(2))
            .await
            .unwrap();
        assert_eq!(loaded.tables, 2);
        assert_eq!(loaded.rows, 1000);

        assert_same_rows(&source, &target, "app", "people");
        assert!(target.rows("app", "audit").unwrap().is_empty());
        assert!(!target.has_table("mysql", "user"));
        assert_eq!(count_statements(&source, "`mysql`."), 0);
    }

    // Scenario: a table estimated at 640000 bytes is dumped with 128 KiB chunks.
    // Expected Outcome: five data files split on evenly spaced key boundaries.
    #[traced_test]
    #[tokio::test]
    async fn chunks_follow_bytes_per_chunk() {
        let source = source_server(10_000);
        let storage = MemoryStorage::new("chunks");
        assert_eq!(10_000 * AVG_ROW_LENGTH, 640_000);

        let report = dump_tables(
            Arc::new(source.clone()),
            shared(&storage),
            "app".into(),
            vec!["people".into()],
            false,
            dump_options(3, MIN_BYTES_PER_CHUNK),
        )
        .await
        .unwrap();

        assert_eq!(report.chunks, 5);
        assert_eq!(data_files(&storage, "app@people@").await.len(), 5);
        assert_eq!(count_statements(&source, "WHERE `id` >= 2001 AND `id` < 4001 ORDER BY `id`"), 1);
        assert_eq!(count_statements(&source, "WHERE `id` < 2001 ORDER BY `id`"), 1);
        assert_eq!(count_statements(&source, "WHERE `id` >= 8001 ORDER BY `id`"), 1);

        let manifest: TableManifest = serde_json::from_slice(&storage.read("app@people.json").await.unwrap()).unwrap();
        let indexes: Vec<usize> = manifest.chunks.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        assert_eq!(manifest.total_rows(), 10_000);
    }

    // Scenario: a worker cannot open its consistent snapshot while the global read lock is held.
    // Expected Outcome: the dump fails, the lock is released and no data file is written.
    #[traced_test]
    #[tokio::test]
    async fn failed_snapshot_releases_the_read_lock() {
        let source = source_server(100);
        source.fail_on("START TRANSACTION WITH CONSISTENT SNAPSHOT", 1, 1205);
        let storage = MemoryStorage::new("lock");

        let err = dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(2, MIN_BYTES_PER_CHUNK))
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Consistency(_)), "{err}");

        let statements = source.statements();
        let locked = statements
            .iter()
            .position(|s| s == "FLUSH TABLES WITH READ LOCK")
            .unwrap();
        let unlocked = statements.iter().rposition(|s| s == "UNLOCK TABLES").unwrap();
        assert!(locked < unlocked);
        assert!(data_files(&storage, "").await.is_empty());
        assert!(!storage.exists(DONE_FILE).await.unwrap());
    }

    // Scenario: one chunk fails, then the same dump is started again.
    // Expected Outcome:
    // - The first run reports the failed chunk and leaves no completion marker.
    // - The second run dumps only what is missing, on the original boundaries.
    // - The finished dump loads completely.
    #[traced_test]
    #[tokio::test]
    async fn interrupted_dump_resumes_where_it_stopped() {
        let source = source_server(10_000);
        source.fail_on("WHERE `id` >= 4001 AND `id` < 6001", 1, 1105);
        let storage = MemoryStorage::new("resume-dump");

        let err = dump_schemas(
            Arc::new(source.clone()),
            shared(&storage),
            vec!["app".into()],
            dump_options(2, MIN_BYTES_PER_CHUNK),
        )
        .await
        .unwrap_err();
        assert!(matches!(&err, DumpError::TasksFailed(tasks) if tasks == &vec!["chunk:app@people@2".to_string()]));
        assert!(!storage.exists(DONE_FILE).await.unwrap());
        assert!(!storage.exists("app@people.json").await.unwrap());

        let report = dump_schemas(
            Arc::new(source.clone()),
            shared(&storage),
            vec!["app".into()],
            dump_options(2, MIN_BYTES_PER_CHUNK),
        )
        .await
        .unwrap();
        assert!(report.skipped >= 4, "skipped {}", report.skipped);
        assert_eq!(count_statements(&source, "WHERE `id` < 2001 ORDER BY `id`"), 1);
        assert_eq!(count_statements(&source, "WHERE `id` >= 4001 AND `id` < 6001"), 2);
        assert_dump_complete(&storage).await;

        let target = target_server();
        load_dump(Arc::new(target.clone()), shared(&storage), load_options(2))
            .await
            .unwrap();
        assert_same_rows(&source, &target, "app", "people");
    }

    // Scenario: a second dump is started into a location holding a completed one.
    // Expected Outcome: the dump refuses to run.
    #[tokio::test]
    async fn completed_dump_is_not_overwritten() {
        let source = source_server(10);
        let storage = MemoryStorage::new("complete");
        dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(1, 0))
            .await
            .unwrap();

        let err = dump_instance(Arc::new(source), shared(&storage), dump_options(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::AlreadyComplete(_)));
    }

    // Scenario: a load stops on a non-retryable error in the middle of a chunk and is started again.
    // Expected Outcome:
    // - Batches committed before the failure stay in the target.
    // - The rerun replays the chunk ignoring duplicate keys and skips finished work.
    #[traced_test]
    #[tokio::test]
    async fn interrupted_load_resumes_without_duplicates() {
        let source = source_server(1000);
        let storage = MemoryStorage::new("resume-load");
        dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(1, 0))
            .await
            .unwrap();

        let target = target_server();
        target.fail_on("('500', ", 1, 1114);
        let mut options = load_options(1);
        options.bytes_per_transaction = 4096;

        let err = load_dump(Arc::new(target.clone()), shared(&storage), options.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::TasksFailed(_)), "{err}");
        let partial = target.rows("app", "people").unwrap().len();
        assert!(partial > 0 && partial < 1000, "{partial} rows after the failure");

        target.clear_statements();
        load_dump(Arc::new(target.clone()), shared(&storage), options)
            .await
            .unwrap();
        assert_same_rows(&source, &target, "app", "people");
        assert!(count_statements(&target, "INSERT IGNORE INTO `app`.`people`") > 0);
        assert_eq!(count_statements(&target, "CREATE TABLE"), 0);
    }

    // Scenario: a batch hits a deadlock once.
    // Expected Outcome: the chunk is retried with duplicates ignored and the load succeeds in one run.
    #[traced_test]
    #[tokio::test]
    async fn deadlocked_batch_is_retried() {
        let source = source_server(1000);
        let storage = MemoryStorage::new("deadlock");
        dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(1, 0))
            .await
            .unwrap();

        let target = target_server();
        target.fail_on("('700', ", 1, 1213);
        let mut options = load_options(2);
        options.bytes_per_transaction = 4096;

        let report = load_dump(Arc::new(target.clone()), shared(&storage), options)
            .await
            .unwrap();
        assert_eq!(report.rows, 1000);
        assert_same_rows(&source, &target, "app", "people");
        assert!(count_statements(&target, "INSERT IGNORE INTO `app`.`people`") > 0);
    }

    // Scenario: the target already has a table the dump contains.
    // Expected Outcome: the load aborts before creating or loading anything.
    #[tokio::test]
    async fn existing_tables_abort_the_load() {
        let source = source_server(10);
        let storage = MemoryStorage::new("conflict");
        dump_instance(Arc::new(source.clone()), shared(&storage), dump_options(1, 0))
            .await
            .unwrap();

        let target = target_server().with_table("app", "people", [(1, Some("kept".to_string()))]);
        let err = load_dump(Arc::new(target.clone()), shared(&storage), load_options(1))
            .await
            .unwrap_err();
        assert!(matches!(&err, LoadError::ObjectsExist(objects) if objects == &vec!["app.people".to_string()]));
        assert_eq!(count_statements(&target, "INSERT"), 0);
        assert_eq!(target.rows("app", "people").unwrap().len(), 1);
    }

    // Scenario: writes of the dump metadata fail with transient errors.
    // Expected Outcome: the writes are retried and the dump completes.
    #[traced_test]
    #[tokio::test]
    async fn storage_hiccups_are_retried() {
        let source = source_server(100);
        let memory = MemoryStorage::new("flaky");
        let flaky = Arc::new(
            FlakyStorage::new(memory.clone())
                .fail_writes(MANIFEST_FILE, 2)
                .fail_writes("app@people.json", 1)
                .fail_writes(DONE_FILE, 1),
        );

        dump_instance(Arc::new(source.clone()), flaky.clone(), dump_options(2, 0))
            .await
            .unwrap();
        assert_eq!(flaky.failures(), 4);
        assert_dump_complete(&memory).await;

        let target = target_server();
        load_dump(Arc::new(target.clone()), shared(&memory), load_options(2))
            .await
            .unwrap();
        assert_same_rows(&source, &target, "app", "people");
    }

    // Scenario: 250000 rows go through a dump and a load with several workers on each side.
    // Expected Outcome: sixteen chunks, and the target matches the source row for row.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn large_table_round_trip() {
        let source = source_server(250_000);
        let storage = MemoryStorage::new("large");

        let dumped = dump_tables(
            Arc::new(source.clone()),
            shared(&storage),
            "app".into(),
            vec!["people".into()],
            false,
            dump_options(4, 1 << 20),
        )
        .await
        .unwrap();
        assert_eq!(dumped.chunks, 16);
        assert_eq!(dumped.rows, 250_000);

        let target = target_server();
        let loaded = load_dump(Arc::new(target.clone()), shared(&storage), load_options(4))
            .await
            .unwrap();
        assert_eq!(loaded.rows, 250_000);
        assert_eq!(loaded.chunks, 16);
        assert_same_rows(&source, &target, "app", "people");
    }
}
