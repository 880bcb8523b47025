use crate::core::{
    identifiers::{ObjectName, TaskId},
    utils::quote_identifier,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }

    /// Started at some point but never finished.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything the progress tracker can key by id.
pub trait Task {
    fn id(&self) -> &TaskId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Zstd,
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".zst") {
            Compression::Zstd
        } else if name.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Schema,
    Table,
    View,
    Procedure,
    Function,
    Event,
    Trigger,
    Users,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Schema => "schema",
            ObjectKind::Table => "table",
            ObjectKind::View => "view",
            ObjectKind::Procedure => "procedure",
            ObjectKind::Function => "function",
            ObjectKind::Event => "event",
            ObjectKind::Trigger => "trigger",
            ObjectKind::Users => "users",
        }
    }

    /// Objects created after table data has been loaded.
    pub fn is_dependent(&self) -> bool {
        matches!(
            self,
            ObjectKind::Procedure | ObjectKind::Function | ObjectKind::Event | ObjectKind::Trigger
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open key range `[lower, upper)` over the chunking index columns.
/// Bounds are SQL literals; a missing bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub columns: Vec<String>,
    pub lower: Option<Vec<String>>,
    pub upper: Option<Vec<String>>,
}

impl ChunkRange {
    /// `WHERE` predicate for the range, `None` when unbounded on both sides.
    pub fn predicate(&self) -> Option<String> {
        let cols = row_expr(&self.columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>());
        let mut parts = Vec::new();
        if let Some(lower) = &self.lower {
            parts.push(format!("{cols} >= {}", row_expr(lower)));
        }
        if let Some(upper) = &self.upper {
            parts.push(format!("{cols} < {}", row_expr(upper)));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" AND "))
        }
    }
}

fn row_expr(items: &[String]) -> String {
    if items.len() == 1 {
        items[0].clone()
    } else {
        format!("({})", items.join(", "))
    }
}

/// A bounded slice of one table's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub id: TaskId,
    pub table: ObjectName,
    pub index: usize,
    pub estimated_bytes: u64,
    pub compression: Compression,
    pub file: String,
    pub range: Option<ChunkRange>,
    /// Columns used to order the rows inside the chunk.
    pub order_by: Vec<String>,
    pub status: TaskStatus,
}

impl Task for ChunkTask {
    fn id(&self) -> &TaskId {
        &self.id
    }
}

/// Capture of one object's definition into its own file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlTask {
    pub id: TaskId,
    pub kind: ObjectKind,
    pub object: ObjectName,
    pub file: String,
    /// Owning table, for triggers.
    pub table: Option<String>,
    pub status: TaskStatus,
}

impl Task for DdlTask {
    fn id(&self) -> &TaskId {
        &self.id
    }
}
