pub mod dialect;
pub mod files;
pub mod manifest;
pub mod task;
