//! Deterministic file names inside a dump location.

use crate::{
    core::{identifiers::ObjectName, utils::encode_name},
    dump::task::{Compression, ObjectKind},
};

pub const MANIFEST_FILE: &str = "@.json";
pub const DONE_FILE: &str = "@.done.json";
pub const USERS_FILE: &str = "@.users.sql";
/// Chunk boundaries of a dump in progress, reused when it is resumed.
pub const CHUNK_PLAN_FILE: &str = "@.chunks.json";
pub const DUMP_PROGRESS_FILE: &str = "dump-progress.json";
pub const BINLOG_MANIFEST_FILE: &str = "@.binlog.json";

pub fn load_progress_file(server_uuid: &str) -> String {
    format!("load-progress.{}.json", encode_name(server_uuid))
}

pub fn binlog_progress_file(server_uuid: &str) -> String {
    format!("binlog-load-progress.{}.json", encode_name(server_uuid))
}

pub fn schema_ddl_file(schema: &str) -> String {
    format!("{}.sql", encode_name(schema))
}

pub fn object_ddl_file(kind: ObjectKind, object: &ObjectName) -> String {
    match kind {
        ObjectKind::Schema => schema_ddl_file(&object.schema),
        ObjectKind::Users => USERS_FILE.to_string(),
        ObjectKind::Table | ObjectKind::View => format!("{}.sql", object.encoded()),
        other => format!("{}.{}.sql", object.encoded(), other.as_str()),
    }
}

pub fn table_manifest_file(table: &ObjectName) -> String {
    format!("{}.json", table.encoded())
}

pub fn data_file(
    table: &ObjectName,
    index: usize,
    extension: &str,
    compression: Compression,
) -> String {
    format!(
        "{}@{}.{}{}",
        table.encoded(),
        index,
        extension,
        compression.extension()
    )
}

pub fn binlog_segment_file(basename: &str, sequence: u64, compression: Compression) -> String {
    format!(
        "{}.{:06}.binlog{}",
        encode_name(basename),
        sequence,
        compression.extension()
    )
}

pub fn binlog_segment_meta_file(basename: &str, sequence: u64) -> String {
    format!("{}.{:06}.json", encode_name(basename), sequence)
}
