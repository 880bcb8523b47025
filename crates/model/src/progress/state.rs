use crate::{
    core::identifiers::TaskId,
    dump::task::{Task, TaskStatus},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One durable status transition. Progress files are a sequence of these;
/// for any task id the last entry wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: TaskId,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEntry {
    pub fn new(id: TaskId, status: TaskStatus) -> Self {
        Self {
            id,
            status,
            at: Utc::now(),
            rows: None,
            bytes: None,
            gtid: None,
            error: None,
        }
    }

    pub fn with_counts(mut self, rows: u64, bytes: u64) -> Self {
        self.rows = Some(rows);
        self.bytes = Some(bytes);
        self
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Folded view of a progress log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    statuses: HashMap<TaskId, TaskStatus>,
    rows: HashMap<TaskId, u64>,
    bytes: HashMap<TaskId, u64>,
    last_gtid: Option<String>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a ProgressEntry>) -> Self {
        let mut state = Self::new();
        for entry in entries {
            state.apply(entry);
        }
        state
    }

    pub fn apply(&mut self, entry: &ProgressEntry) {
        self.statuses.insert(entry.id.clone(), entry.status);
        if let Some(rows) = entry.rows {
            self.rows.insert(entry.id.clone(), rows);
        }
        if let Some(bytes) = entry.bytes {
            self.bytes.insert(entry.id.clone(), bytes);
        }
        if let Some(gtid) = &entry.gtid {
            self.last_gtid = Some(gtid.clone());
        }
    }

    pub fn status(&self, id: &TaskId) -> TaskStatus {
        self.statuses.get(id).copied().unwrap_or_default()
    }

    pub fn is_done(&self, id: &TaskId) -> bool {
        self.status(id).is_done()
    }

    pub fn rows(&self, id: &TaskId) -> Option<u64> {
        self.rows.get(id).copied()
    }

    pub fn bytes(&self, id: &TaskId) -> Option<u64> {
        self.bytes.get(id).copied()
    }

    pub fn last_gtid(&self) -> Option<&str> {
        self.last_gtid.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Tasks of a freshly computed task list that still need work.
    pub fn remaining<'a, T: Task>(&self, tasks: &'a [T]) -> Vec<&'a T> {
        tasks.iter().filter(|t| !self.is_done(t.id())).collect()
    }

    pub fn ids_with(&self, status: TaskStatus) -> Vec<&TaskId> {
        let mut ids: Vec<&TaskId> = self
            .statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct T(TaskId);

    impl Task for T {
        fn id(&self) -> &TaskId {
            &self.0
        }
    }

    #[test]
    fn last_entry_wins_per_key() {
        let a = TaskId::new("a");
        let entries = vec![
            ProgressEntry::new(a.clone(), TaskStatus::InProgress),
            ProgressEntry::new(a.clone(), TaskStatus::Failed).with_error("boom"),
            ProgressEntry::new(a.clone(), TaskStatus::Done).with_counts(10, 100),
        ];
        let state = ProgressState::from_entries(&entries);
        assert_eq!(state.status(&a), TaskStatus::Done);
        assert_eq!(state.rows(&a), Some(10));
    }

    #[test]
    fn remaining_skips_only_done_tasks() {
        let mut state = ProgressState::new();
        state.apply(&ProgressEntry::new("a".into(), TaskStatus::Done));
        state.apply(&ProgressEntry::new("b".into(), TaskStatus::InProgress));
        state.apply(&ProgressEntry::new("c".into(), TaskStatus::Failed));

        let tasks = vec![T("a".into()), T("b".into()), T("c".into()), T("d".into())];
        let ids: Vec<&str> = state
            .remaining(&tasks)
            .into_iter()
            .map(|t| t.0.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }
}
