pub mod actor;
pub mod binlog;
pub mod context;
pub mod copy;
pub mod dump;
pub mod error;
pub mod load;
pub mod snapshot;
