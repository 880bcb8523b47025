use connectors::error::DbError;
use engine_config::error::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Catalog query failed: {0}")]
    Db(#[from] DbError),

    #[error("Schema '{0}' does not exist")]
    MissingSchema(String),

    #[error("Table '{0}' does not exist")]
    MissingTable(String),

    #[error("Unexpected catalog row: {0}")]
    Catalog(String),
}
