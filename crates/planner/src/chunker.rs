use crate::{
    catalog::{IndexInfo, TableStatus},
    error::PlanError,
};
use connectors::session::{Session, query_row};
use model::{
    core::{
        identifiers::ObjectName,
        utils::{bytes_literal, quote_identifier},
    },
    dump::{manifest::ColumnInfo, task::ChunkRange},
};
use tracing::debug;

const INTEGER_TYPES: [&str; 5] = ["tinyint", "smallint", "mediumint", "int", "bigint"];
/// Integer keys spread over more than this many values per row are split by
/// sampling instead of arithmetic.
const SPARSE_KEY_FACTOR: i128 = 4;

/// Index the chunk ranges are expressed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    pub name: String,
    pub columns: Vec<String>,
    /// Single integer column, split arithmetically.
    pub integer: bool,
}

/// Picks the primary key, or else the narrowest unique index whose columns
/// are all NOT NULL. Without one the table cannot be split.
pub fn choose_index(indexes: &[IndexInfo], columns: &[ColumnInfo]) -> Option<ChunkIndex> {
    let is_integer = |name: &str| {
        columns
            .iter()
            .find(|c| c.name == name)
            .is_some_and(|c| INTEGER_TYPES.contains(&c.data_type.as_str()))
    };

    let candidate = indexes.iter().find(|i| i.is_primary()).or_else(|| {
        indexes
            .iter()
            .filter(|i| i.unique && !i.nullable && i.kind == "BTREE")
            .min_by_key(|i| {
                let integer = i.columns.len() == 1 && is_integer(&i.columns[0]);
                (i.columns.len(), !integer)
            })
    })?;

    Some(ChunkIndex {
        name: candidate.name.clone(),
        columns: candidate.columns.clone(),
        integer: candidate.columns.len() == 1 && is_integer(&candidate.columns[0]),
    })
}

/// `max(1, ceil(S / B))`
pub fn chunk_count(estimated_bytes: u64, bytes_per_chunk: u64) -> usize {
    if bytes_per_chunk == 0 {
        return 1;
    }
    estimated_bytes.div_ceil(bytes_per_chunk).max(1) as usize
}

/// Splits one table into key ranges of roughly `bytes_per_chunk` each.
pub struct Chunker<'a> {
    session: &'a dyn Session,
    bytes_per_chunk: u64,
}

impl<'a> Chunker<'a> {
    pub fn new(session: &'a dyn Session, bytes_per_chunk: u64) -> Self {
        Self {
            session,
            bytes_per_chunk,
        }
    }

    /// Ranges covering the whole key space, in key order. The first range is
    /// unbounded below and the last unbounded above, so rows outside the
    /// sampled bounds are never lost.
    pub async fn ranges(
        &self,
        table: &ObjectName,
        index: &ChunkIndex,
        status: &TableStatus,
        where_clause: Option<&str>,
    ) -> Result<Vec<ChunkRange>, PlanError> {
        let wanted = chunk_count(status.estimated_bytes(), self.bytes_per_chunk);
        if wanted <= 1 {
            return Ok(vec![unbounded(index)]);
        }

        let arithmetic = if index.integer {
            self.integer_boundaries(table, index, status.rows, wanted, where_clause)
                .await?
        } else {
            None
        };
        let boundaries = match arithmetic {
            Some(boundaries) => boundaries,
            None => {
                self.sampled_boundaries(table, index, status.rows, wanted, where_clause)
                    .await?
            }
        };

        debug!(
            table = %table,
            index = %index.name,
            wanted,
            chunks = boundaries.len() + 1,
            "Computed chunk boundaries"
        );
        Ok(to_ranges(index, boundaries))
    }

    /// Evenly spaced key values, or `None` when the keys are too sparse for
    /// equal key ranges to hold similar row counts.
    async fn integer_boundaries(
        &self,
        table: &ObjectName,
        index: &ChunkIndex,
        estimated_rows: u64,
        wanted: usize,
        where_clause: Option<&str>,
    ) -> Result<Option<Vec<Vec<String>>>, PlanError> {
        let column = quote_identifier(&index.columns[0]);
        let sql = format!(
            "SELECT MIN({column}), MAX({column}) FROM {}{}",
            table.quoted(),
            where_sql(where_clause)
        );
        let Some(row) = query_row(self.session, &sql).await? else {
            return Ok(Some(Vec::new()));
        };
        let (Some(min), Some(max)) = (
            row.get_str(0).and_then(|v| v.parse::<i128>().ok()),
            row.get_str(1).and_then(|v| v.parse::<i128>().ok()),
        ) else {
            // Empty table.
            return Ok(Some(Vec::new()));
        };

        let span = max - min + 1;
        if estimated_rows > 0 && span > estimated_rows as i128 * SPARSE_KEY_FACTOR {
            debug!(table = %table, span, estimated_rows, "Sparse integer key, sampling boundaries");
            return Ok(None);
        }
        let chunks = (wanted as i128).min(span).max(1);
        let step = (span + chunks - 1) / chunks;
        Ok(Some(
            (1..chunks)
                .map(|i| min + i * step)
                .take_while(|b| *b <= max)
                .map(|b| vec![b.to_string()])
                .collect(),
        ))
    }

    async fn sampled_boundaries(
        &self,
        table: &ObjectName,
        index: &ChunkIndex,
        estimated_rows: u64,
        wanted: usize,
        where_clause: Option<&str>,
    ) -> Result<Vec<Vec<String>>, PlanError> {
        if estimated_rows < 2 {
            return Ok(Vec::new());
        }
        let rows_per_chunk = estimated_rows.div_ceil(wanted as u64).max(1);
        let columns = index
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut boundaries: Vec<Vec<String>> = Vec::new();
        for k in 1..wanted as u64 {
            let sql = format!(
                "SELECT {columns} FROM {}{} ORDER BY {columns} LIMIT 1 OFFSET {}",
                table.quoted(),
                where_sql(where_clause),
                k * rows_per_chunk
            );
            let Some(row) = query_row(self.session, &sql).await? else {
                break;
            };
            let boundary: Vec<String> = row
                .values()
                .iter()
                .map(|v| match v {
                    Some(bytes) => bytes_literal(bytes),
                    None => "NULL".to_string(),
                })
                .collect();
            if boundaries.last() != Some(&boundary) {
                boundaries.push(boundary);
            }
        }
        Ok(boundaries)
    }
}

fn where_sql(where_clause: Option<&str>) -> String {
    match where_clause {
        Some(w) if !w.trim().is_empty() => format!(" WHERE ({w})"),
        _ => String::new(),
    }
}

fn unbounded(index: &ChunkIndex) -> ChunkRange {
    ChunkRange {
        columns: index.columns.clone(),
        lower: None,
        upper: None,
    }
}

fn to_ranges(index: &ChunkIndex, boundaries: Vec<Vec<String>>) -> Vec<ChunkRange> {
    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut lower = None;
    for boundary in boundaries {
        ranges.push(ChunkRange {
            columns: index.columns.clone(),
            lower: lower.take(),
            upper: Some(boundary.clone()),
        });
        lower = Some(boundary);
    }
    ranges.push(ChunkRange {
        columns: index.columns.clone(),
        lower,
        upper: None,
    });
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableType;
    use connectors::session::{QueryResult, Row, recording::RecordingSession};

    fn col(name: &str, ty: &str, nullable: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: ty.into(),
            nullable,
            generated: false,
        }
    }

    fn idx(name: &str, unique: bool, nullable: bool, cols: &[&str]) -> IndexInfo {
        IndexInfo {
            name: name.into(),
            unique,
            columns: cols.iter().map(|c| c.to_string()).collect(),
            nullable,
            kind: "BTREE".into(),
        }
    }

    fn status(rows: u64, bytes: u64) -> TableStatus {
        TableStatus {
            name: "t".into(),
            kind: TableType::BaseTable,
            engine: Some("InnoDB".into()),
            rows,
            avg_row_length: 0,
            data_length: bytes,
        }
    }

    #[test]
    fn prefers_primary_then_not_null_unique() {
        let cols = [col("id", "int", false), col("code", "varchar", false), col("x", "int", true)];
        let pk = choose_index(&[idx("u", true, false, &["code"]), idx("PRIMARY", true, false, &["id"])], &cols)
            .unwrap();
        assert_eq!(pk.name, "PRIMARY");
        assert!(pk.integer);

        let uk = choose_index(&[idx("nullable", true, true, &["x"]), idx("u", true, false, &["code"])], &cols)
            .unwrap();
        assert_eq!(uk.name, "u");
        assert!(!uk.integer);

        assert!(choose_index(&[idx("k", false, false, &["id"])], &cols).is_none());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 100), 1);
        assert_eq!(chunk_count(99, 100), 1);
        assert_eq!(chunk_count(101, 100), 2);
        assert_eq!(chunk_count(1000, 100), 10);
    }

    #[tokio::test]
    async fn integer_key_splits_into_equal_ranges() {
        let session = RecordingSession::with_responder(|sql| {
            sql.starts_with("SELECT MIN(").then(|| {
                Ok(QueryResult::with_rows(&["min", "max"], vec![Row::from_strs(&[Some("1"), Some("1000")])]))
            })
        });
        let index = ChunkIndex {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            integer: true,
        };
        let table = ObjectName::new("s", "t");
        let ranges = Chunker::new(&session, 100)
            .ranges(&table, &index, &status(1000, 1000), None)
            .await
            .unwrap();

        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0].predicate().unwrap(), "`id` < 101");
        assert_eq!(ranges[1].predicate().unwrap(), "`id` >= 101 AND `id` < 201");
        assert_eq!(ranges[9].predicate().unwrap(), "`id` >= 901");
    }

    #[tokio::test]
    async fn never_more_chunks_than_distinct_keys() {
        let session = RecordingSession::with_responder(|sql| {
            sql.starts_with("SELECT MIN(").then(|| {
                Ok(QueryResult::with_rows(&["min", "max"], vec![Row::from_strs(&[Some("5"), Some("7")])]))
            })
        });
        let index = ChunkIndex {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            integer: true,
        };
        let ranges = Chunker::new(&session, 10)
            .ranges(&ObjectName::new("s", "t"), &index, &status(3, 10_000), None)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 3);
    }

    #[tokio::test]
    async fn sparse_integer_keys_are_sampled() {
        // 999 dense keys and one far outlier.
        let keys: Vec<i64> = (1..1000).chain([1_000_000_000]).collect();
        let served = keys.clone();
        let session = RecordingSession::with_responder(move |sql| {
            if sql.starts_with("SELECT MIN(") {
                return Some(Ok(QueryResult::with_rows(
                    &["min", "max"],
                    vec![Row::from_strs(&[Some("1"), Some("1000000000")])],
                )));
            }
            let offset: usize = sql.rsplit("OFFSET ").next()?.parse().ok()?;
            let key = served.get(offset)?.to_string();
            Some(Ok(QueryResult::with_rows(&["id"], vec![Row::from_strs(&[Some(key.as_str())])])))
        });
        let index = ChunkIndex {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            integer: true,
        };
        let ranges = Chunker::new(&session, 100)
            .ranges(&ObjectName::new("s", "t"), &index, &status(1000, 1000), None)
            .await
            .unwrap();

        assert_eq!(ranges.len(), 10);
        let bound = |b: &Option<Vec<String>>| b.as_ref().map(|v| v[0].trim_matches('\'').parse::<i64>().unwrap());
        for range in &ranges {
            let (lower, upper) = (bound(&range.lower), bound(&range.upper));
            let rows = keys
                .iter()
                .filter(|k| lower.is_none_or(|l| **k >= l) && upper.is_none_or(|u| **k < u))
                .count();
            assert!(rows <= 200, "range {:?} holds {rows} rows", range.predicate());
        }
    }

    #[tokio::test]
    async fn sampled_boundaries_are_deduplicated() {
        let session = RecordingSession::with_responder(|sql| {
            let value = if sql.ends_with("OFFSET 25") { "b" } else if sql.contains("OFFSET") { "m" } else { return None };
            Some(Ok(QueryResult::with_rows(&["code"], vec![Row::from_strs(&[Some(value)])])))
        });
        let index = ChunkIndex {
            name: "u".into(),
            columns: vec!["code".into()],
            integer: false,
        };
        let ranges = Chunker::new(&session, 100)
            .ranges(&ObjectName::new("s", "t"), &index, &status(100, 400), None)
            .await
            .unwrap();

        // Offsets 25, 50, 75 give b, m, m.
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1].predicate().unwrap(), "`code` >= 'b' AND `code` < 'm'");
        assert!(session.statements()[0].contains("ORDER BY `code` LIMIT 1 OFFSET 25"));
    }

    #[tokio::test]
    async fn small_tables_get_one_unbounded_chunk() {
        let session = RecordingSession::new();
        let index = ChunkIndex {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
            integer: true,
        };
        let ranges = Chunker::new(&session, 1 << 20)
            .ranges(&ObjectName::new("s", "t"), &index, &status(10, 500), None)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].predicate().is_none());
        assert!(session.statements().is_empty());
    }
}
