use std::time::Duration;
use thiserror::Error;

/// MySQL server error codes the engine reacts to.
pub mod codes {
    pub const ER_DBACCESS_DENIED: u16 = 1044;
    pub const ER_ACCESS_DENIED: u16 = 1045;
    pub const ER_TABLEACCESS_DENIED: u16 = 1142;
    pub const ER_SPECIFIC_ACCESS_DENIED: u16 = 1227;
    pub const ER_CON_COUNT: u16 = 1040;
    pub const ER_BAD_HOST: u16 = 1042;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_TABLE_EXISTS: u16 = 1050;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_BAD_DB: u16 = 1049;
    pub const ER_SP_ALREADY_EXISTS: u16 = 1304;
    pub const ER_TRG_ALREADY_EXISTS: u16 = 1359;
    pub const ER_EVT_ALREADY_EXISTS: u16 = 1537;
    pub const CR_CONNECTION_ERROR: u16 = 2002;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
}

/// All errors coming from a database session.
#[derive(Debug, Error)]
pub enum DbError {
    /// Error reported by the server for a statement.
    #[error("Server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    /// Any other driver error.
    #[error("MySQL driver error: {0}")]
    Driver(mysql_async::Error),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected result: {0}")]
    UnexpectedResult(String),
}

impl DbError {
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        DbError::Server {
            code,
            state: "HY000".into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            DbError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(
            self.code(),
            Some(
                codes::ER_DBACCESS_DENIED
                    | codes::ER_ACCESS_DENIED
                    | codes::ER_TABLEACCESS_DENIED
                    | codes::ER_SPECIFIC_ACCESS_DENIED
            )
        )
    }

    /// Transient failures worth retrying with a fresh attempt.
    pub fn is_transient(&self) -> bool {
        // See: https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html
        const RETRYABLE_CODES: [u16; 8] = [
            codes::ER_LOCK_WAIT_TIMEOUT,
            codes::ER_LOCK_DEADLOCK,
            codes::CR_CONNECTION_ERROR,
            codes::CR_CONN_HOST_ERROR,
            codes::CR_SERVER_GONE,
            codes::CR_SERVER_LOST,
            codes::ER_CON_COUNT,
            codes::ER_BAD_HOST,
        ];
        match self {
            DbError::Server { code, state, .. } => {
                RETRYABLE_CODES.contains(code) || matches!(state.as_str(), "40001" | "HYT00" | "08S01")
            }
            DbError::Driver(mysql_async::Error::Io(_)) => true,
            DbError::Driver(_) => false,
            DbError::Io(_) => true,
            DbError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<mysql_async::Error> for DbError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => DbError::Server {
                code: server.code,
                state: server.state,
                message: server.message,
            },
            other => DbError::Driver(other),
        }
    }
}

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} for '{name}'")]
    Status { status: u16, name: String },

    #[error("Invalid storage URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No backend registered for '{0}'")]
    Unsupported(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Invalid data in '{name}': {reason}")]
    InvalidData { name: String, reason: String },

    #[error("Transient storage failure: {0}")]
    Transient(String),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            StorageError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            StorageError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            StorageError::Transient(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_errors() {
        assert!(DbError::server(codes::ER_SPECIFIC_ACCESS_DENIED, "need RELOAD").is_access_denied());
        assert!(DbError::server(codes::ER_LOCK_DEADLOCK, "deadlock").is_transient());
        assert!(!DbError::server(1064, "syntax").is_transient());
    }

    #[test]
    fn classifies_storage_errors() {
        let throttled = StorageError::Status {
            status: 429,
            name: "x".into(),
        };
        assert!(throttled.is_transient());
        assert!(!StorageError::NotFound("x".into()).is_transient());
    }
}
