//! Retry scheduler: a min-heap of future retry events drained by a single
//! timer driver that wakes when the heap root becomes due.
//!
//! The scheduler is purely in-memory; the engine writes every retry through
//! the store *before* handing it here, and reloads pending entries on
//! startup. Each live entry fires exactly once, at or after its `fire_at`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

/// Commands accepted by the driver.
#[derive(Debug)]
pub enum SchedulerCommand {
    Schedule {
        task_id: String,
        fire_at: DateTime<Utc>,
        attempt: u32,
    },
    Cancel {
        task_id: String,
    },
}

/// Emitted into the engine loop when a retry becomes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFired {
    pub task_id: String,
    pub attempt: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    fire_at: DateTime<Utc>,
    task_id: String,
    attempt: u32,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Idle wake interval when the heap is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Client handle to a running scheduler driver.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn schedule(&self, task_id: impl Into<String>, fire_at: DateTime<Utc>, attempt: u32) {
        let _ = self
            .commands
            .send(SchedulerCommand::Schedule {
                task_id: task_id.into(),
                fire_at,
                attempt,
            })
            .await;
    }

    pub async fn cancel(&self, task_id: impl Into<String>) {
        let _ = self
            .commands
            .send(SchedulerCommand::Cancel {
                task_id: task_id.into(),
            })
            .await;
    }
}

/// The timer driver. Owns the heap plus a live-entry index so cancellations
/// and reschedules tombstone stale heap entries.
pub struct RetryScheduler {
    commands: mpsc::Receiver<SchedulerCommand>,
    fired: mpsc::Sender<RetryFired>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Live entries: task id -> (fire_at, attempt). A heap entry that does
    /// not match is stale and skipped.
    live: HashMap<String, (DateTime<Utc>, u32)>,
}

impl RetryScheduler {
    /// Spawn a scheduler task. Dropping every handle clone stops the driver.
    pub fn spawn(fired: mpsc::Sender<RetryFired>) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(64);
        let scheduler = Self {
            commands: rx,
            fired,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        };
        tokio::spawn(scheduler.run());
        SchedulerHandle { commands: tx }
    }

    async fn run(mut self) {
        loop {
            let sleep_for = self.next_due_in().unwrap_or(IDLE_SLEEP);
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    if self.fire_due().await.is_err() {
                        // Engine receiver gone; nothing left to drive.
                        break;
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Schedule {
                task_id,
                fire_at,
                attempt,
            } => {
                debug!(task_id = %task_id, fire_at = %fire_at, attempt, "retry scheduled");
                self.live.insert(task_id.clone(), (fire_at, attempt));
                self.heap.push(Reverse(HeapEntry {
                    fire_at,
                    task_id,
                    attempt,
                }));
            }
            SchedulerCommand::Cancel { task_id } => {
                debug!(task_id = %task_id, "retry cancelled");
                self.live.remove(&task_id);
            }
        }
    }

    /// Time until the earliest live entry, skimming stale heap roots.
    fn next_due_in(&mut self) -> Option<Duration> {
        loop {
            let root = self.heap.peek()?;
            let entry = &root.0;
            let is_live = self
                .live
                .get(&entry.task_id)
                .is_some_and(|&(fire_at, attempt)| fire_at == entry.fire_at && attempt == entry.attempt);
            if !is_live {
                self.heap.pop();
                continue;
            }
            let until = entry.fire_at - Utc::now();
            return Some(until.to_std().unwrap_or(Duration::ZERO));
        }
    }

    /// Drain every due entry in one pass.
    async fn fire_due(&mut self) -> Result<(), ()> {
        let now = Utc::now();
        while let Some(root) = self.heap.peek() {
            if root.0.fire_at > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked root");
            let is_live = self
                .live
                .get(&entry.task_id)
                .is_some_and(|&(fire_at, attempt)| fire_at == entry.fire_at && attempt == entry.attempt);
            if !is_live {
                continue;
            }
            self.live.remove(&entry.task_id);
            self.fired
                .send(RetryFired {
                    task_id: entry.task_id,
                    attempt: entry.attempt,
                })
                .await
                .map_err(|_| ())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn fires_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RetryScheduler::spawn(tx);

        let now = Utc::now();
        handle
            .schedule("second", now + ChronoDuration::milliseconds(80), 2)
            .await;
        handle
            .schedule("first", now + ChronoDuration::milliseconds(20), 1)
            .await;

        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.task_id, "first");
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.task_id, "second");
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn past_due_fires_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RetryScheduler::spawn(tx);

        handle
            .schedule("overdue", Utc::now() - ChronoDuration::seconds(5), 1)
            .await;
        let fired = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.task_id, "overdue");
    }

    #[tokio::test]
    async fn cancel_suppresses_firing() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RetryScheduler::spawn(tx);

        let now = Utc::now();
        handle
            .schedule("doomed", now + ChronoDuration::milliseconds(50), 1)
            .await;
        handle
            .schedule("survivor", now + ChronoDuration::milliseconds(80), 1)
            .await;
        handle.cancel("doomed").await;

        let fired = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.task_id, "survivor");
    }

    #[tokio::test]
    async fn reschedule_replaces_previous_entry() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RetryScheduler::spawn(tx);

        let now = Utc::now();
        handle
            .schedule("task", now + ChronoDuration::milliseconds(30), 1)
            .await;
        handle
            .schedule("task", now + ChronoDuration::milliseconds(90), 2)
            .await;

        let fired = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(fired.attempt, 2);
        // The stale first entry must not fire a second event.
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
    }
}
