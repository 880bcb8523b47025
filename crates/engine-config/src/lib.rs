pub mod error;
pub mod filter;
pub mod options;
pub mod settings;
