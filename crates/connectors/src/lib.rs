pub mod binlog;
pub mod codec;
pub mod error;
pub mod session;
pub mod storage;
