use crate::error::TaskError;
use connectors::session::{Session, query_row};
use model::{
    core::{identifiers::ObjectName, utils::quote_identifier},
    dump::manifest::ChunkChecksum,
};

/// `COUNT(*)` and an order-independent CRC over the given rows. NULL and
/// empty strings hash differently thanks to the trailing ISNULL flags.
pub fn checksum_sql(table: &ObjectName, columns: &[&str], predicate: Option<&str>) -> String {
    let crc = if columns.is_empty() {
        "0".to_string()
    } else {
        let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
        let nulls: Vec<String> = quoted.iter().map(|c| format!("ISNULL({c})")).collect();
        format!(
            "COALESCE(BIT_XOR(CAST(CRC32(CONCAT_WS('#', {}, CONCAT({}))) AS UNSIGNED)), 0)",
            quoted.join(", "),
            nulls.join(", ")
        )
    };
    let mut sql = format!("SELECT COUNT(*), {crc} FROM {}", table.quoted());
    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql
}

pub async fn compute(
    session: &dyn Session,
    table: &ObjectName,
    columns: &[&str],
    predicate: Option<&str>,
) -> Result<ChunkChecksum, TaskError> {
    let sql = checksum_sql(table, columns, predicate);
    let row = query_row(session, &sql).await?;
    Ok(ChunkChecksum {
        count: row.as_ref().and_then(|r| r.get_u64(0)).unwrap_or(0),
        crc: row.as_ref().and_then(|r| r.get_u64(1)).unwrap_or(0),
    })
}

/// Joins the chunk range and the user filter into one `WHERE` body.
pub fn combine_predicates(range: Option<&str>, filter: Option<&str>) -> Option<String> {
    match (range, filter) {
        (Some(range), Some(filter)) => Some(format!("({range}) AND ({filter})")),
        (Some(range), None) => Some(range.to_string()),
        (None, Some(filter)) => Some(format!("({filter})")),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::session::{QueryResult, Row, recording::RecordingSession};

    #[test]
    fn builds_checksum_query() {
        let sql = checksum_sql(&ObjectName::new("s", "t"), &["id", "name"], Some("`id` < 10"));
        assert_eq!(
            sql,
            "SELECT COUNT(*), COALESCE(BIT_XOR(CAST(CRC32(CONCAT_WS('#', `id`, `name`, CONCAT(ISNULL(`id`), ISNULL(`name`)))) AS UNSIGNED)), 0) FROM `s`.`t` WHERE `id` < 10"
        );
    }

    #[test]
    fn combines_range_and_filter() {
        assert_eq!(
            combine_predicates(Some("`id` >= 5"), Some("a = 1 OR b = 2")).as_deref(),
            Some("(`id` >= 5) AND (a = 1 OR b = 2)")
        );
        assert_eq!(combine_predicates(None, None), None);
    }

    #[tokio::test]
    async fn reads_count_and_crc() {
        let session = RecordingSession::with_responder(|_| {
            Some(Ok(QueryResult::with_rows(
                &["c", "crc"],
                vec![Row::from_strs(&[Some("42"), Some("123456")])],
            )))
        });
        let checksum = compute(&session, &ObjectName::new("s", "t"), &["id"], None)
            .await
            .unwrap();
        assert_eq!(checksum, ChunkChecksum { count: 42, crc: 123456 });
    }
}
