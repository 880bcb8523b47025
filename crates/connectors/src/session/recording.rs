use super::{QueryResult, Session, SessionFactory};
use crate::error::DbError;
use async_trait::async_trait;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

type Responder = dyn Fn(&str) -> Option<Result<QueryResult, DbError>> + Send + Sync;

/// A session that records every statement instead of talking to a server.
///
/// Statements are answered by an optional responder; anything it does not
/// answer succeeds with an empty result. Used for dry runs and in tests.
pub struct RecordingSession {
    id: u64,
    statements: Arc<Mutex<Vec<String>>>,
    responder: Option<Arc<Responder>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl RecordingSession {
    pub fn new() -> Self {
        RecordingSession {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            statements: Arc::new(Mutex::new(Vec::new())),
            responder: None,
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<Result<QueryResult, DbError>> + Send + Sync + 'static,
    {
        RecordingSession {
            responder: Some(Arc::new(responder)),
            ..Self::new()
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DbError> {
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(sql.to_string());
        }
        match &self.responder {
            Some(responder) => responder(sql).unwrap_or_else(|| Ok(QueryResult::empty())),
            None => Ok(QueryResult::empty()),
        }
    }

    fn connection_id(&self) -> u64 {
        self.id
    }
}

/// Hands out recording sessions that share one statement log.
#[derive(Clone, Default)]
pub struct RecordingSessionFactory {
    statements: Arc<Mutex<Vec<String>>>,
    responder: Option<Arc<Responder>>,
}

impl RecordingSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<Result<QueryResult, DbError>> + Send + Sync + 'static,
    {
        RecordingSessionFactory {
            statements: Arc::default(),
            responder: Some(Arc::new(responder)),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionFactory for RecordingSessionFactory {
    async fn open(&self) -> Result<Arc<dyn Session>, DbError> {
        Ok(Arc::new(RecordingSession {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            statements: self.statements.clone(),
            responder: self.responder.clone(),
        }))
    }

    fn describe(&self) -> String {
        "dry-run".to_string()
    }

    async fn kill_query(&self, connection_id: u64) -> Result<(), DbError> {
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(format!("KILL QUERY {connection_id}"));
        }
        Ok(())
    }
}
