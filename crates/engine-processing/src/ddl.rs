//! Capturing object definitions into script files and reading them back.

use crate::{compat::Compatibility, error::TaskError};
use connectors::session::Session;
use engine_config::options::DeferIndexes;
use model::{
    core::{identifiers::ObjectName, utils::quote_identifier},
    dump::task::{DdlTask, ObjectKind},
};
use planner::{TablePlan, catalog::account_name};
use tracing::{debug, warn};

const BLOCK_DELIMITER: &str = ";;";
const USER_BEGIN: &str = "-- begin user ";
const USER_END: &str = "-- end user ";

fn show_create_sql(kind: ObjectKind, object: &ObjectName) -> Option<(String, usize)> {
    let (what, target, column) = match kind {
        ObjectKind::Schema => ("DATABASE", quote_identifier(&object.schema), 1),
        ObjectKind::Table => ("TABLE", object.quoted(), 1),
        ObjectKind::View => ("VIEW", object.quoted(), 1),
        ObjectKind::Procedure => ("PROCEDURE", object.quoted(), 2),
        ObjectKind::Function => ("FUNCTION", object.quoted(), 2),
        ObjectKind::Event => ("EVENT", object.quoted(), 3),
        ObjectKind::Trigger => ("TRIGGER", object.quoted(), 2),
        ObjectKind::Users => return None,
    };
    Some((format!("SHOW CREATE {what} {target}"), column))
}

/// Definition text as reported by the server.
pub async fn show_create(
    session: &dyn Session,
    kind: ObjectKind,
    object: &ObjectName,
) -> Result<String, TaskError> {
    let fail = |reason: &str| TaskError::Ddl {
        kind: kind.to_string(),
        object: object.to_string(),
        reason: reason.to_string(),
    };
    let (sql, column) = show_create_sql(kind, object).ok_or_else(|| fail("not a single object"))?;
    let result = session.execute(&sql).await?;
    let row = result.first().ok_or_else(|| fail("no definition returned"))?;
    // Without enough privileges the server answers with a NULL body.
    row.get_string(column)
        .ok_or_else(|| fail("definition is hidden, check the SHOW_ROUTINE privilege"))
}

/// Captures one object and renders its script file.
pub async fn capture(
    session: &dyn Session,
    task: &DdlTask,
    compat: &Compatibility,
    table: Option<&TablePlan>,
) -> Result<String, TaskError> {
    let ddl = show_create(session, task.kind, &task.object).await?;
    let ddl = match task.kind {
        ObjectKind::Schema if !ddl.contains("IF NOT EXISTS") => {
            ddl.replacen("CREATE DATABASE ", "CREATE DATABASE IF NOT EXISTS ", 1)
        }
        ObjectKind::Schema => ddl,
        ObjectKind::Table => {
            let ddl = compat.rewrite(ObjectKind::Table, &ddl);
            match table {
                Some(plan) if !plan.has_primary_key => match compat.fix_missing_primary_key(&ddl) {
                    Some(fixed) => fixed,
                    None => {
                        if !compat.ignores_missing_primary_keys() {
                            warn!(table = %task.object, "Table has no primary key");
                        }
                        ddl
                    }
                },
                _ => ddl,
            }
        }
        kind => compat.rewrite(kind, &ddl),
    };
    debug!(kind = %task.kind, object = %task.object, bytes = ddl.len(), "Captured definition");
    Ok(render_script(task.kind, &task.object, &[ddl]))
}

/// Captures accounts and their grants into the users script.
pub async fn capture_users(
    session: &dyn Session,
    accounts: &[(String, String)],
    compat: &Compatibility,
) -> Result<String, TaskError> {
    let mut out = String::from("-- Accounts\n");
    for (user, host) in accounts {
        let account = account_name(user, host);
        let create = session
            .execute(&format!("SHOW CREATE USER {account}"))
            .await?
            .first()
            .and_then(|r| r.get_string(0))
            .ok_or_else(|| TaskError::Ddl {
                kind: "user".into(),
                object: account.clone(),
                reason: "no definition returned".into(),
            })?;
        if !compat.account_allowed(&create) {
            warn!(account = %account, "Skipping account that cannot be recreated");
            continue;
        }

        let grants = session.execute(&format!("SHOW GRANTS FOR {account}")).await?;
        out.push_str(USER_BEGIN);
        out.push_str(&account);
        out.push('\n');
        out.push_str(&create.replacen("CREATE USER ", "CREATE USER IF NOT EXISTS ", 1));
        out.push_str(";\n");
        for grant in grants.rows.iter().filter_map(|r| r.get_str(0)) {
            match compat.rewrite_grant(grant) {
                Some(grant) => {
                    out.push_str(&grant);
                    out.push_str(";\n");
                }
                None => debug!(account = %account, "Dropped restricted grant"),
            }
        }
        out.push_str(USER_END);
        out.push_str(&account);
        out.push('\n');
    }
    Ok(out)
}

/// Compound statements carry `;` in their bodies, so they are written
/// under a different delimiter.
fn needs_block_delimiter(kind: ObjectKind) -> bool {
    matches!(
        kind,
        ObjectKind::Procedure | ObjectKind::Function | ObjectKind::Event | ObjectKind::Trigger
    )
}

pub fn render_script(kind: ObjectKind, object: &ObjectName, statements: &[String]) -> String {
    let mut out = format!("-- {kind} {object}\n");
    if needs_block_delimiter(kind) {
        out.push_str("DELIMITER ;;\n");
        for stmt in statements {
            out.push_str(stmt);
            out.push_str(BLOCK_DELIMITER);
            out.push('\n');
        }
        out.push_str("DELIMITER ;\n");
    } else {
        for stmt in statements {
            out.push_str(stmt);
            out.push_str(";\n");
        }
    }
    out
}

/// Splits a script into statements, honouring `DELIMITER` directives.
/// A statement ends at a line whose end is the current delimiter.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut delimiter = ";".to_string();
    let mut current = String::new();

    for line in script.lines() {
        let trimmed = line.trim();
        if current.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with("-- ") || trimmed == "--" {
                continue;
            }
            if let Some(head) = trimmed.get(..10)
                && head.eq_ignore_ascii_case("DELIMITER ")
            {
                delimiter = trimmed[10..].trim().to_string();
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let end = current.trim_end();
        if let Some(stmt) = end.strip_suffix(delimiter.as_str()) {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                statements.push(stmt.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }
    statements
}

/// One account block of the users script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountScript {
    /// `'user'@'host'`
    pub account: String,
    pub statements: Vec<String>,
}

pub fn parse_users_script(script: &str) -> Vec<AccountScript> {
    let mut accounts = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in script.lines() {
        if let Some(account) = line.strip_prefix(USER_BEGIN) {
            current = Some((account.trim().to_string(), String::new()));
        } else if line.starts_with(USER_END) {
            if let Some((account, body)) = current.take() {
                accounts.push(AccountScript {
                    account,
                    statements: split_statements(&body),
                });
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    accounts
}

/// `CREATE TABLE` with some secondary indexes taken out, to be added back
/// after the data is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredIndexes {
    pub create: String,
    /// Index definitions as they appear in the table body.
    pub indexes: Vec<String>,
}

fn is_deferrable(definition: &str, mode: DeferIndexes, auto_increment: Option<&str>) -> bool {
    let upper = definition.to_ascii_uppercase();
    let fulltext = upper.starts_with("FULLTEXT KEY");
    let secondary = upper.starts_with("KEY ")
        || upper.starts_with("UNIQUE KEY")
        || upper.starts_with("SPATIAL KEY")
        || fulltext;
    if !secondary {
        return false;
    }
    // The auto-increment column must stay indexed while rows go in.
    if let Some(column) = auto_increment
        && let Some(open) = definition.find('(')
        && definition[open + 1..].trim_start().starts_with(column)
    {
        return false;
    }
    match mode {
        DeferIndexes::Off => false,
        DeferIndexes::Fulltext => fulltext,
        DeferIndexes::All => true,
    }
}

pub fn split_deferred_indexes(create: &str, mode: DeferIndexes) -> DeferredIndexes {
    let untouched = || DeferredIndexes {
        create: create.to_string(),
        indexes: Vec::new(),
    };
    if mode == DeferIndexes::Off {
        return untouched();
    }
    let lines: Vec<&str> = create.lines().collect();
    let Some(close) = lines.iter().rposition(|l| l.starts_with(')')) else {
        return untouched();
    };
    if close == 0 {
        return untouched();
    }

    let definitions: Vec<&str> = lines[1..close]
        .iter()
        .map(|l| l.trim().trim_end_matches(','))
        .collect();
    let auto_increment = definitions
        .iter()
        .find(|d| d.starts_with('`') && d.to_ascii_uppercase().contains(" AUTO_INCREMENT"))
        .and_then(|d| d.split_whitespace().next());

    let (deferred, kept): (Vec<&str>, Vec<&str>) = definitions
        .iter()
        .partition(|d| is_deferrable(d, mode, auto_increment));
    if deferred.is_empty() {
        return untouched();
    }

    let mut out = String::from(lines[0]);
    out.push('\n');
    out.push_str(
        &kept
            .iter()
            .map(|d| format!("  {d}"))
            .collect::<Vec<_>>()
            .join(",\n"),
    );
    out.push('\n');
    out.push_str(&lines[close..].join("\n"));

    DeferredIndexes {
        create: out,
        indexes: deferred.into_iter().map(str::to_string).collect(),
    }
}

/// `ALTER TABLE ... ADD ...` statements restoring deferred indexes. InnoDB
/// builds one fulltext index per statement.
pub fn add_indexes_statements(table: &ObjectName, indexes: &[String]) -> Vec<String> {
    let (fulltext, regular): (Vec<&String>, Vec<&String>) = indexes
        .iter()
        .partition(|i| i.to_ascii_uppercase().starts_with("FULLTEXT"));

    let mut statements = Vec::new();
    if !regular.is_empty() {
        let adds: Vec<String> = regular.iter().map(|i| format!("ADD {i}")).collect();
        statements.push(format!("ALTER TABLE {} {}", table.quoted(), adds.join(", ")));
    }
    for index in fulltext {
        statements.push(format!("ALTER TABLE {} ADD {index}", table.quoted()));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::session::{QueryResult, Row, recording::RecordingSession};
    use engine_config::settings::{CompatibilityConfig, CompatibilityOption};
    use model::{core::identifiers::TaskId, dump::task::TaskStatus};

    const CREATE_ITEMS: &str = "CREATE TABLE `items` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `name` varchar(64) NOT NULL,\n  `body` text,\n  PRIMARY KEY (`id`),\n  KEY `by_name` (`name`),\n  FULLTEXT KEY `ft_body` (`body`)\n) ENGINE=InnoDB";

    #[test]
    fn defers_only_fulltext_by_default() {
        let split = split_deferred_indexes(CREATE_ITEMS, DeferIndexes::Fulltext);
        assert_eq!(split.indexes, vec!["FULLTEXT KEY `ft_body` (`body`)"]);
        assert!(split.create.contains("  KEY `by_name` (`name`)\n) ENGINE=InnoDB"));
        assert!(!split.create.contains("FULLTEXT"));
    }

    #[test]
    fn defers_all_secondary_indexes() {
        let split = split_deferred_indexes(CREATE_ITEMS, DeferIndexes::All);
        assert_eq!(split.indexes.len(), 2);
        assert!(split.create.ends_with("  PRIMARY KEY (`id`)\n) ENGINE=InnoDB"));

        let table = ObjectName::new("s", "items");
        let statements = add_indexes_statements(&table, &split.indexes);
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE `s`.`items` ADD KEY `by_name` (`name`)".to_string(),
                "ALTER TABLE `s`.`items` ADD FULLTEXT KEY `ft_body` (`body`)".to_string(),
            ]
        );
        assert_eq!(split_deferred_indexes(CREATE_ITEMS, DeferIndexes::Off).create, CREATE_ITEMS);
    }

    #[test]
    fn keeps_auto_increment_index() {
        let create = "CREATE TABLE `t` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `k` int,\n  KEY `by_id` (`id`),\n  KEY `by_k` (`k`)\n) ENGINE=InnoDB";
        let split = split_deferred_indexes(create, DeferIndexes::All);
        assert_eq!(split.indexes, vec!["KEY `by_k` (`k`)"]);
    }

    #[test]
    fn splits_scripts_with_delimiters() {
        let object = ObjectName::new("s", "p");
        let body = "CREATE PROCEDURE `p`()\nBEGIN\n  SELECT 1;\n  SELECT 2;\nEND".to_string();
        let script = render_script(ObjectKind::Procedure, &object, &[body.clone()]);
        assert_eq!(split_statements(&script), vec![body]);

        let table = "-- table s.t\nCREATE TABLE `t` (\n  `a` int\n);\n";
        assert_eq!(split_statements(table), vec!["CREATE TABLE `t` (\n  `a` int\n)"]);
    }

    #[tokio::test]
    async fn captures_users_with_grants() {
        let session = RecordingSession::with_responder(|sql| {
            let row = |v: &str| Row::from_strs(&[Some(v)]);
            if sql.starts_with("SHOW CREATE USER 'app'") {
                Some(Ok(QueryResult::with_rows(&["c"], vec![row(
                    "CREATE USER `app`@`%` IDENTIFIED WITH 'caching_sha2_password' AS 'x'",
                )])))
            } else if sql.starts_with("SHOW CREATE USER") {
                Some(Ok(QueryResult::with_rows(&["c"], vec![row("CREATE USER `nopw`@`%`")])))
            } else if sql.starts_with("SHOW GRANTS") {
                Some(Ok(QueryResult::with_rows(&["g"], vec![
                    row("GRANT SELECT, SUPER ON *.* TO `app`@`%`"),
                    row("GRANT FILE ON *.* TO `app`@`%`"),
                ])))
            } else {
                None
            }
        });
        let compat = Compatibility::new(CompatibilityConfig {
            compatibility: vec![
                CompatibilityOption::StripRestrictedGrants,
                CompatibilityOption::SkipInvalidAccounts,
            ],
        });
        let accounts = vec![("app".to_string(), "%".to_string()), ("nopw".to_string(), "%".to_string())];
        let script = capture_users(&session, &accounts, &compat).await.unwrap();

        let parsed = parse_users_script(&script);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].account, "'app'@'%'");
        assert_eq!(
            parsed[0].statements,
            vec![
                "CREATE USER IF NOT EXISTS `app`@`%` IDENTIFIED WITH 'caching_sha2_password' AS 'x'".to_string(),
                "GRANT SELECT ON *.* TO `app`@`%`".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn capture_reports_hidden_routine_bodies() {
        let session = RecordingSession::with_responder(|sql| {
            sql.starts_with("SHOW CREATE PROCEDURE").then(|| {
                Ok(QueryResult::with_rows(
                    &["Procedure", "sql_mode", "Create Procedure"],
                    vec![Row::from_strs(&[Some("p"), Some(""), None])],
                ))
            })
        });
        let task = DdlTask {
            id: TaskId::new("ddl:procedure:s@p"),
            kind: ObjectKind::Procedure,
            object: ObjectName::new("s", "p"),
            file: "s@p.procedure.sql".into(),
            table: None,
            status: TaskStatus::Pending,
        };
        let err = capture(&session, &task, &Compatibility::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Ddl { .. }));
        assert_eq!(session.statements(), vec!["SHOW CREATE PROCEDURE `s`.`p`"]);
    }
}
