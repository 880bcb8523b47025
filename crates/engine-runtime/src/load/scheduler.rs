//! Distribution of chunk loads over worker threads, weighted by table size.

use futures::lock::Mutex;
use model::{core::identifiers::ObjectName, dump::manifest::ChunkEntry};
use std::{cmp::Ordering, collections::VecDeque};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkJob {
    pub table: ObjectName,
    pub chunk: ChunkEntry,
}

#[derive(Debug)]
struct TableSlot {
    name: ObjectName,
    bytes: u64,
    cap: usize,
    active: usize,
    remaining_bytes: u64,
    chunks: VecDeque<ChunkEntry>,
}

impl TableSlot {
    /// `active / cap` compared without division.
    fn load_cmp(&self, other: &TableSlot) -> Ordering {
        (self.active * other.cap).cmp(&(other.active * self.cap))
    }
}

/// Picks the next chunk so that every table gets threads in proportion to
/// its share of the data. A table's cap is `max(1, round(share * threads))`;
/// workers take from the table with the lowest `active / cap`, and among
/// equals from the one with the most bytes left. Caps are only exceeded when
/// every table with pending chunks is already at its cap.
#[derive(Debug)]
pub struct DataScheduler {
    threads: usize,
    total_bytes: u64,
    slots: Vec<TableSlot>,
}

impl DataScheduler {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            total_bytes: 0,
            slots: Vec::new(),
        }
    }

    /// Queues the chunks of a table and rebalances every cap.
    pub fn add_table(&mut self, name: ObjectName, chunks: Vec<ChunkEntry>) {
        let bytes: u64 = chunks.iter().map(|c| c.data_bytes).sum();
        self.total_bytes += bytes;
        self.slots.push(TableSlot {
            name,
            bytes,
            cap: 1,
            active: 0,
            remaining_bytes: bytes,
            chunks: chunks.into(),
        });
        self.rebalance();
    }

    fn rebalance(&mut self) {
        let total = self.total_bytes.max(1) as f64;
        for slot in &mut self.slots {
            let share = slot.bytes as f64 / total;
            slot.cap = ((share * self.threads as f64).round() as usize).max(1);
        }
    }

    pub fn next(&mut self) -> Option<ChunkJob> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|s| !s.chunks.is_empty())
            .min_by(|a, b| {
                a.load_cmp(b)
                    .then_with(|| b.remaining_bytes.cmp(&a.remaining_bytes))
            })?;
        let chunk = slot.chunks.pop_front()?;
        slot.active += 1;
        slot.remaining_bytes = slot.remaining_bytes.saturating_sub(chunk.data_bytes);
        Some(ChunkJob {
            table: slot.name.clone(),
            chunk,
        })
    }

    pub fn finished(&mut self, table: &ObjectName) {
        if let Some(slot) = self.slots.iter_mut().find(|s| &s.name == table) {
            slot.active = slot.active.saturating_sub(1);
        }
    }

    pub fn cap(&self, table: &ObjectName) -> Option<usize> {
        self.slots.iter().find(|s| &s.name == table).map(|s| s.cap)
    }

    pub fn active(&self, table: &ObjectName) -> usize {
        self.slots
            .iter()
            .find(|s| &s.name == table)
            .map(|s| s.active)
            .unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.slots.iter().map(|s| s.chunks.len()).sum()
    }

    /// Tables with no chunk queued or running.
    pub fn is_drained(&self, table: &ObjectName) -> bool {
        self.slots
            .iter()
            .find(|s| &s.name == table)
            .is_none_or(|s| s.chunks.is_empty() && s.active == 0)
    }
}

struct QueueState {
    scheduler: DataScheduler,
    closed: bool,
}

/// Async front of [`DataScheduler`] shared by the load workers. Tables may
/// keep arriving until the queue is closed.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(threads: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                scheduler: DataScheduler::new(threads),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn add_table(&self, name: ObjectName, chunks: Vec<ChunkEntry>) {
        self.state.lock().await.scheduler.add_table(name, chunks);
        self.notify.notify_waiters();
    }

    /// No more tables will be added.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Waits for the next chunk. `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<ChunkJob> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.scheduler.next() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a chunk of `table` as no longer running. Returns whether the
    /// table has nothing left queued or running.
    pub async fn finished(&self, table: &ObjectName) -> bool {
        let drained = {
            let mut state = self.state.lock().await;
            state.scheduler.finished(table);
            state.scheduler.is_drained(table)
        };
        self.notify.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunks(table: &str, sizes: &[u64]) -> Vec<ChunkEntry> {
        sizes
            .iter()
            .enumerate()
            .map(|(index, bytes)| ChunkEntry {
                index,
                file: format!("s@{table}@{index}.tsv"),
                rows: 1,
                data_bytes: *bytes,
                file_bytes: *bytes,
                range: None,
                checksum: None,
            })
            .collect()
    }

    fn name(table: &str) -> ObjectName {
        ObjectName::new("s", table)
    }

    #[test]
    fn caps_follow_table_share() {
        let mut scheduler = DataScheduler::new(8);
        scheduler.add_table(name("big"), chunks("big", &[300, 300, 300]));
        scheduler.add_table(name("small"), chunks("small", &[50, 50]));
        scheduler.add_table(name("empty"), Vec::new());

        assert_eq!(scheduler.cap(&name("big")), Some(7));
        assert_eq!(scheduler.cap(&name("small")), Some(1));
        assert_eq!(scheduler.cap(&name("empty")), Some(1));
    }

    #[test]
    fn workers_spread_by_active_over_cap() {
        let mut scheduler = DataScheduler::new(4);
        scheduler.add_table(name("a"), chunks("a", &[100, 100, 100, 100, 100, 100]));
        scheduler.add_table(name("b"), chunks("b", &[100, 100, 100, 100, 100, 100]));

        let picks: Vec<String> = (0..4)
            .map(|_| scheduler.next().unwrap().table.name)
            .collect();
        assert_eq!(picks.iter().filter(|t| *t == "a").count(), 2);
        assert_eq!(picks.iter().filter(|t| *t == "b").count(), 2);
        assert_eq!(scheduler.active(&name("a")), 2);
    }

    #[test]
    fn ties_go_to_the_table_with_most_bytes_left() {
        let mut scheduler = DataScheduler::new(1);
        scheduler.add_table(name("small"), chunks("small", &[10]));
        scheduler.add_table(name("large"), chunks("large", &[500]));
        let first = scheduler.next().unwrap();
        assert_eq!(first.table, name("large"));
    }

    #[test]
    fn table_drains_after_its_last_chunk() {
        let mut scheduler = DataScheduler::new(2);
        scheduler.add_table(name("t"), chunks("t", &[1, 1]));
        let a = scheduler.next().unwrap();
        let _b = scheduler.next().unwrap();
        assert!(scheduler.next().is_none());
        scheduler.finished(&a.table);
        assert!(!scheduler.is_drained(&name("t")));
        scheduler.finished(&a.table);
        assert!(scheduler.is_drained(&name("t")));
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test]
    async fn queue_waits_for_late_tables() {
        let queue = Arc::new(JobQueue::new(2));
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(job) = queue.take().await {
                    queue.finished(&job.table).await;
                    taken.push(job.chunk.index);
                }
                taken
            })
        };

        tokio::task::yield_now().await;
        queue.add_table(name("late"), chunks("late", &[5, 5, 5])).await;
        queue.close().await;
        let mut taken = worker.await.unwrap();
        taken.sort();
        assert_eq!(taken, vec![0, 1, 2]);
    }
}
