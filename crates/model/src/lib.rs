pub mod binlog;
pub mod core;
pub mod dump;
pub mod progress;
