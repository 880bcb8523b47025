use crate::{commands::ReportArgs, error::CliError};
use engine_runtime::{
    binlog::{BinlogDumpReport, BinlogLoadReport},
    copy::CopyReport,
    dump::{DumpReport, export::ExportReport},
    load::LoadReport,
};
use serde_json::{Map, Value};
use std::time::Duration;

/// Final report of an operation, printed as a two column table or as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    title: String,
    fields: Vec<(String, Value)>,
    statements: Vec<String>,
}

impl Summary {
    pub fn new(title: impl Into<String>) -> Self {
        Summary {
            title: title.into(),
            fields: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.push((name.to_string(), value.into()));
        self
    }

    fn elapsed(self, elapsed: Duration) -> Self {
        let secs = (elapsed.as_secs_f64() * 10.0).round() / 10.0;
        self.field("elapsed_secs", secs)
    }

    /// Statements a dry run would have executed.
    fn statements(mut self, statements: &[String]) -> Self {
        self.statements = statements.to_vec();
        self
    }

    pub fn to_json(&self) -> Result<String, CliError> {
        let mut object = Map::new();
        object.insert("operation".into(), Value::String(self.title.clone()));
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.clone());
        }
        if !self.statements.is_empty() {
            object.insert("dry_run_statements".into(), self.statements.clone().into());
        }
        Ok(serde_json::to_string_pretty(&Value::Object(object))?)
    }

    pub fn to_table(&self) -> String {
        let mut out = format!("{}:\n-----------------------------\n", self.title);
        for (name, value) in &self.fields {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => "n/a".to_string(),
                other => other.to_string(),
            };
            out.push_str(&format!("{name:<20} {value}\n"));
        }
        for statement in &self.statements {
            out.push_str(statement);
            out.push_str(";\n");
        }
        out
    }
}

impl From<&DumpReport> for Summary {
    fn from(report: &DumpReport) -> Self {
        Summary::new("Dump")
            .field("tables", report.tables)
            .field("ddl_files", report.ddl_files)
            .field("chunks", report.chunks)
            .field("rows", report.rows)
            .field("data_bytes", report.data_bytes)
            .field("file_bytes", report.file_bytes)
            .field("skipped", report.skipped)
            .elapsed(report.elapsed)
    }
}

impl From<&LoadReport> for Summary {
    fn from(report: &LoadReport) -> Self {
        Summary::new("Load")
            .field("tables", report.tables)
            .field("chunks", report.chunks)
            .field("rows", report.rows)
            .field("data_bytes", report.data_bytes)
            .field("ddl_statements", report.ddl_statements)
            .field("indexes", report.indexes)
            .field("skipped_chunks", report.skipped_chunks)
            .field("warnings", report.warnings)
            .field("checksum_mismatches", report.checksum_mismatches)
            .elapsed(report.elapsed)
            .statements(&report.dry_run_statements)
    }
}

impl From<&ExportReport> for Summary {
    fn from(report: &ExportReport) -> Self {
        Summary::new("Export")
            .field("file", report.file.clone())
            .field("rows", report.rows)
            .field("data_bytes", report.data_bytes)
            .field("file_bytes", report.file_bytes)
    }
}

impl From<&BinlogDumpReport> for Summary {
    fn from(report: &BinlogDumpReport) -> Self {
        Summary::new("Binlog dump")
            .field("segments", report.segments)
            .field("events", report.events)
            .field("transactions", report.transactions)
            .field("data_bytes", report.data_bytes)
            .field("file_bytes", report.file_bytes)
            .field("ignored_ddl", report.ignored_ddl)
            .field("gtid_end", report.gtid_end.clone())
            .field("end_position", report.end_position.as_ref().map(|p| p.to_string()))
            .elapsed(report.elapsed)
    }
}

impl From<&BinlogLoadReport> for Summary {
    fn from(report: &BinlogLoadReport) -> Self {
        Summary::new("Binlog load")
            .field("segments", report.segments)
            .field("transactions", report.transactions)
            .field("skipped", report.skipped)
            .field("statements", report.statements)
            .field("last_gtid", report.last_gtid.clone())
            .field("stopped", report.stopped)
            .elapsed(report.elapsed)
            .statements(&report.dry_run_statements)
    }
}

impl From<&CopyReport> for Summary {
    fn from(report: &CopyReport) -> Self {
        Summary::new("Copy")
            .field("tables", report.load.tables)
            .field("chunks", report.dump.chunks)
            .field("rows_dumped", report.dump.rows)
            .field("rows_loaded", report.load.rows)
            .field("data_bytes", report.load.data_bytes)
            .field("indexes", report.load.indexes)
            .field("warnings", report.load.warnings)
            .elapsed(report.dump.elapsed.max(report.load.elapsed))
            .statements(&report.load.dry_run_statements)
    }
}

pub async fn emit(summary: Summary, args: &ReportArgs) -> Result<(), CliError> {
    match &args.report {
        Some(path) => tokio::fs::write(path, summary.to_json()?).await?,
        None if args.json => println!("{}", summary.to_json()?),
        None => print!("{}", summary.to_table()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lists_fields_in_order() {
        let report = DumpReport {
            tables: 2,
            chunks: 5,
            rows: 1000,
            ..Default::default()
        };
        let table = Summary::from(&report).to_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Dump:");
        assert!(lines[2].starts_with("tables") && lines[2].ends_with(" 2"));
        assert!(table.contains(&format!("{:<20} 1000", "rows")));
    }

    #[test]
    fn dry_run_statements_are_printed() {
        let report = LoadReport {
            dry_run_statements: vec!["CREATE DATABASE IF NOT EXISTS `app`".into()],
            ..Default::default()
        };
        let summary = Summary::from(&report);
        assert!(summary.to_table().ends_with("CREATE DATABASE IF NOT EXISTS `app`;\n"));

        let json: Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["operation"], "Load");
        assert_eq!(json["dry_run_statements"][0], "CREATE DATABASE IF NOT EXISTS `app`");
    }

    #[test]
    fn missing_values_show_as_na() {
        let table = Summary::from(&BinlogLoadReport::default()).to_table();
        assert!(table.contains(&format!("{:<20} n/a", "last_gtid")));
    }
}
