//! Binary-log continuation of a dump: the dumper appends segments of the
//! events written since the dump, the loader replays them on a target.

pub mod dumper;
pub mod loader;
pub mod source;

pub use dumper::{BinlogDumpReport, BinlogDumper, dump_binlogs};
pub use loader::{BinlogLoadReport, BinlogLoader, load_binlogs};
pub use source::{BinlogSource, MemoryBinlogSource, ReplicationBinlogSource, SqlBinlogSource};
