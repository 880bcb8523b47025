pub mod binlog;
pub mod checksum;
pub mod compat;
pub mod ddl;
pub mod dump;
pub mod error;
pub mod load;
pub mod retry;
