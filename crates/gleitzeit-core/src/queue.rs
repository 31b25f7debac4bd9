//! Priority-ordered ready queue: strict priority with FIFO within each
//! level, secondary indices for O(1) cancel by task or workflow, bounded
//! capacity surfaced as a retryable backpressure error, and an optional
//! deterministic aging promotion.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::model::Priority;

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of live entries across all priority lanes.
    pub capacity: usize,
    /// Promote a task one priority level after waiting this long.
    /// `None` disables aging.
    pub aging_threshold: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            aging_threshold: None,
        }
    }
}

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is at capacity. Retryable backpressure, not a fault.
    #[error("ready queue is full ({capacity} entries)")]
    Full { capacity: usize },

    #[error("task {0:?} is already queued")]
    Duplicate(String),
}

/// A dequeued ready task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: String,
    pub workflow_id: Option<Uuid>,
    pub priority: Priority,
}

#[derive(Debug)]
struct Entry {
    task_id: String,
    workflow_id: Option<Uuid>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    priority: Priority,
    workflow_id: Option<Uuid>,
}

/// Four FIFO lanes, one per priority. `pop` drains the highest non-empty
/// lane. Cancellation is O(1) via tombstones that `pop` skips over.
#[derive(Debug)]
pub struct ReadyQueue {
    config: QueueConfig,
    lanes: [VecDeque<Entry>; 4],
    /// Live entries only: task id -> current priority lane + owner.
    index: HashMap<String, IndexEntry>,
    by_workflow: HashMap<Uuid, HashSet<String>>,
    tombstones: HashSet<String>,
}

impl ReadyQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            index: HashMap::new(),
            by_workflow: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    /// Number of live (non-cancelled) entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    /// Remaining capacity before `push` starts failing.
    pub fn remaining_capacity(&self) -> usize {
        self.config.capacity.saturating_sub(self.len())
    }

    /// Enqueue a ready task at its priority lane's tail.
    pub fn push(
        &mut self,
        task_id: impl Into<String>,
        workflow_id: Option<Uuid>,
        priority: Priority,
    ) -> Result<(), QueueError> {
        let task_id = task_id.into();
        if self.index.contains_key(&task_id) {
            return Err(QueueError::Duplicate(task_id));
        }
        if self.len() >= self.config.capacity {
            return Err(QueueError::Full {
                capacity: self.config.capacity,
            });
        }

        // A re-enqueue after retry may still have an old tombstone.
        self.tombstones.remove(&task_id);

        self.index.insert(
            task_id.clone(),
            IndexEntry {
                priority,
                workflow_id,
            },
        );
        if let Some(wf) = workflow_id {
            self.by_workflow.entry(wf).or_default().insert(task_id.clone());
        }
        self.lanes[priority.index()].push_back(Entry {
            task_id,
            workflow_id,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Dequeue the head of the highest-priority non-empty lane.
    pub fn pop(&mut self) -> Option<QueuedTask> {
        for priority in Priority::ALL {
            let lane = &mut self.lanes[priority.index()];
            while let Some(entry) = lane.pop_front() {
                if self.tombstones.remove(&entry.task_id) {
                    continue;
                }
                // Stale position left behind by an aging promotion.
                if self.index.get(&entry.task_id).map(|e| e.priority) != Some(priority) {
                    continue;
                }
                self.index.remove(&entry.task_id);
                if let Some(wf) = entry.workflow_id {
                    self.remove_workflow_index(wf, &entry.task_id);
                }
                return Some(QueuedTask {
                    task_id: entry.task_id,
                    workflow_id: entry.workflow_id,
                    priority,
                });
            }
        }
        None
    }

    /// Cancel a queued task. Returns `false` when it was not queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        let Some(entry) = self.index.remove(task_id) else {
            return false;
        };
        self.tombstones.insert(task_id.to_owned());
        if let Some(wf) = entry.workflow_id {
            self.remove_workflow_index(wf, task_id);
        }
        true
    }

    /// Cancel every queued task of a workflow. Returns the removed ids.
    pub fn remove_workflow(&mut self, workflow_id: Uuid) -> Vec<String> {
        let Some(task_ids) = self.by_workflow.remove(&workflow_id) else {
            return vec![];
        };
        let mut removed: Vec<String> = task_ids.into_iter().collect();
        removed.sort();
        for task_id in &removed {
            self.index.remove(task_id);
            self.tombstones.insert(task_id.clone());
        }
        removed
    }

    /// Iterate live entries for observability, highest priority first.
    pub fn snapshot(&self) -> Vec<QueuedTask> {
        let mut out = Vec::with_capacity(self.len());
        for priority in Priority::ALL {
            for entry in &self.lanes[priority.index()] {
                let live = self.index.get(&entry.task_id).map(|e| e.priority) == Some(priority);
                if live {
                    out.push(QueuedTask {
                        task_id: entry.task_id.clone(),
                        workflow_id: entry.workflow_id,
                        priority,
                    });
                }
            }
        }
        out
    }

    fn remove_workflow_index(&mut self, workflow_id: Uuid, task_id: &str) {
        if let Some(set) = self.by_workflow.get_mut(&workflow_id) {
            set.remove(task_id);
            if set.is_empty() {
                self.by_workflow.remove(&workflow_id);
            }
        }
    }

    /// Promote entries that have waited past the aging threshold one
    /// priority level. Deterministic: strictly threshold-based, applied
    /// oldest-first. Returns `(task_id, new_priority)` pairs.
    pub fn promote_aged(&mut self, now: Instant) -> Vec<(String, Priority)> {
        let Some(threshold) = self.config.aging_threshold else {
            return vec![];
        };
        let mut promoted = Vec::new();
        // Urgent (lane 0) cannot be promoted further.
        for lane_idx in 1..4 {
            let priority = Priority::ALL[lane_idx];
            loop {
                let Some(entry) = self.lanes[lane_idx].front() else {
                    break;
                };
                let live = self.index.get(&entry.task_id).map(|e| e.priority) == Some(priority)
                    && !self.tombstones.contains(&entry.task_id);
                if !live {
                    if let Some(stale) = self.lanes[lane_idx].pop_front() {
                        self.tombstones.remove(&stale.task_id);
                    }
                    continue;
                }
                if now.duration_since(entry.enqueued_at) < threshold {
                    break;
                }
                let mut entry = self.lanes[lane_idx].pop_front().expect("checked front");
                let target = priority.promoted();
                // The aging clock restarts at the new level.
                entry.enqueued_at = now;
                if let Some(idx) = self.index.get_mut(&entry.task_id) {
                    idx.priority = target;
                }
                promoted.push((entry.task_id.clone(), target));
                self.lanes[target.index()].push_back(entry);
            }
        }
        promoted
    }
}
