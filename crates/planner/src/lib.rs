pub mod catalog;
pub mod chunker;
pub mod error;
pub mod plan;

pub use plan::{DumpPlan, TablePlan, plan};
