//! End-to-end scenarios run against an in-process server double.

pub mod integration;
pub mod server;
pub mod utils;
