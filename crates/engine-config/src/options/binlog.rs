use super::Options;
use crate::{
    error::ConfigError,
    settings::{StorageConfig, bytes::deserialize_bytes},
};
use model::{
    binlog::BinlogPosition,
    core::gtid::{Gtid, GtidSet},
    dump::task::Compression,
};
use serde::Deserialize;

/// Explicit starting point of a binlog dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinlogStart {
    Position(BinlogPosition),
    Gtids(GtidSet),
}

impl BinlogStart {
    /// `binlog.000012:4` is a position, anything else must be a GTID set.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if let Some((file, pos)) = value.rsplit_once(':')
            && file.contains('.')
            && !file.contains(':')
            && pos.chars().all(|c| c.is_ascii_digit())
            && let Some(position) = BinlogPosition::parse(value)
        {
            return Ok(BinlogStart::Position(position));
        }
        Ok(BinlogStart::Gtids(value.parse()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinlogDumpOptions {
    /// `file:position` or a GTID set.
    pub since: Option<String>,
    /// Location of a previous dump to continue from, when it is not the
    /// output location itself.
    pub start_from: Option<String>,
    pub ignore_ddl_changes: bool,
    pub compression: Compression,
    #[serde(deserialize_with = "deserialize_bytes")]
    pub max_segment_bytes: u64,
    pub dry_run: bool,
    pub show_progress: bool,
    pub storage: StorageConfig,
}

impl Default for BinlogDumpOptions {
    fn default() -> Self {
        Self {
            since: None,
            start_from: None,
            ignore_ddl_changes: false,
            compression: Compression::Zstd,
            max_segment_bytes: 64 << 20,
            dry_run: false,
            show_progress: true,
            storage: StorageConfig::default(),
        }
    }
}

impl BinlogDumpOptions {
    pub fn start(&self) -> Result<Option<BinlogStart>, ConfigError> {
        self.since.as_deref().map(BinlogStart::parse).transpose()
    }
}

impl Options for BinlogDumpOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.since.is_some() && self.start_from.is_some() {
            return Err(ConfigError::Conflict("since", "startFrom"));
        }
        self.start()?;
        if self.max_segment_bytes < 4096 {
            return Err(ConfigError::invalid("maxSegmentBytes", "must be at least 4k"));
        }
        self.storage.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BinlogLoadOptions {
    pub ignore_gtid_gap: bool,
    pub stop_before: Option<String>,
    pub stop_after: Option<String>,
    pub dry_run: bool,
    pub reset_progress: bool,
    pub show_progress: bool,
    pub storage: StorageConfig,
}

impl Default for BinlogLoadOptions {
    fn default() -> Self {
        Self {
            ignore_gtid_gap: false,
            stop_before: None,
            stop_after: None,
            dry_run: false,
            reset_progress: false,
            show_progress: true,
            storage: StorageConfig::default(),
        }
    }
}

impl BinlogLoadOptions {
    pub fn stop_before(&self) -> Result<Option<Gtid>, ConfigError> {
        Ok(self.stop_before.as_deref().map(str::parse).transpose()?)
    }

    pub fn stop_after(&self) -> Result<Option<Gtid>, ConfigError> {
        Ok(self.stop_after.as_deref().map(str::parse).transpose()?)
    }
}

impl Options for BinlogLoadOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_before.is_some() && self.stop_after.is_some() {
            return Err(ConfigError::Conflict("stopBefore", "stopAfter"));
        }
        self.stop_before()?;
        self.stop_after()?;
        self.storage.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn parses_start_points() {
        assert_eq!(
            BinlogStart::parse("binlog.000012:4").unwrap(),
            BinlogStart::Position(BinlogPosition {
                file: "binlog.000012".into(),
                position: 4
            })
        );
        match BinlogStart::parse(&format!("{UUID}:1-20")).unwrap() {
            BinlogStart::Gtids(set) => assert_eq!(set.count(), 20),
            other => panic!("unexpected {other:?}"),
        }
        assert!(BinlogStart::parse("garbage").is_err());
    }

    #[test]
    fn stop_points_are_exclusive() {
        let options = BinlogLoadOptions {
            stop_before: Some(format!("{UUID}:5")),
            stop_after: Some(format!("{UUID}:6")),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = BinlogLoadOptions::from_json(&format!(r#"{{"stopAfter":"{UUID}:6"}}"#)).unwrap();
        assert_eq!(options.stop_after().unwrap().unwrap().gno, 6);
    }

    #[test]
    fn dump_options() {
        let options = BinlogDumpOptions::from_json(r#"{"since":"binlog.000001:4","maxSegmentBytes":"1M"}"#)
            .unwrap();
        assert!(matches!(options.start().unwrap(), Some(BinlogStart::Position(_))));
        assert!(
            BinlogDumpOptions::from_json(r#"{"since":"binlog.000001:4","startFrom":"/dumps/full"}"#)
                .is_err()
        );
    }
}
