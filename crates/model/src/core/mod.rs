pub mod gtid;
pub mod identifiers;
pub mod utils;
