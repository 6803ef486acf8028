//! Admission of receiving workers to receive buffers.
//!
//! Under heavy fan-in, posting buffers to every sending worker at once multiplies memory by the
//! number of workers. Receive groups partition the receiving workers; only the current group
//! holds posted buffers. Each admitted worker delivers one message per round, after which the
//! group is retired and the next one is admitted.
//!
//! Without configured groups every receiving worker stays admitted and is never rotated.

use std::collections::BTreeSet;

use crate::error::{CommsError, Result};
use crate::WorkerId;

/// Rotation state of the receive groups of one operation.
#[derive(Debug, Clone)]
pub struct ReceiveGroups {
    groups: Vec<Vec<WorkerId>>,
    current: usize,
    rotating: bool,
    round: usize,
    arrived: BTreeSet<WorkerId>,
    delivered: BTreeSet<WorkerId>,
    finished: BTreeSet<WorkerId>,
}

impl ReceiveGroups {
    /// One permanent group of every receiving worker.
    pub fn single(workers: &[WorkerId]) -> Self {
        ReceiveGroups {
            groups: vec![workers.to_vec()],
            current: 0,
            rotating: false,
            round: 0,
            arrived: BTreeSet::new(),
            delivered: BTreeSet::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Rotating groups starting at `initial`.
    ///
    /// The groups must be non-empty, disjoint and cover exactly `receiving`.
    pub fn setup(initial: usize, groups: Vec<Vec<WorkerId>>, receiving: &[WorkerId]) -> Result<Self> {
        if groups.is_empty() {
            return Err(CommsError::InvalidGroups("no groups".to_string()));
        }
        if initial >= groups.len() {
            return Err(CommsError::InvalidGroups(format!("initial group {} of {}", initial, groups.len())));
        }
        let mut seen = BTreeSet::new();
        for (index, group) in groups.iter().enumerate() {
            if group.is_empty() {
                return Err(CommsError::InvalidGroups(format!("group {} is empty", index)));
            }
            for worker in group {
                if !seen.insert(*worker) {
                    return Err(CommsError::InvalidGroups(format!("worker {} is in more than one group", worker)));
                }
            }
        }
        let expected: BTreeSet<_> = receiving.iter().cloned().collect();
        if seen != expected {
            return Err(CommsError::InvalidGroups(format!("groups cover {:?}, receiving workers are {:?}", seen, expected)));
        }
        Ok(ReceiveGroups {
            groups,
            current: initial,
            rotating: true,
            round: 0,
            arrived: BTreeSet::new(),
            delivered: BTreeSet::new(),
            finished: BTreeSet::new(),
        })
    }

    /// True for configured, rotating groups.
    pub fn is_rotating(&self) -> bool { self.rotating }
    /// Index of the current group.
    pub fn current_index(&self) -> usize { self.current }
    /// Workers of the current group.
    pub fn current_group(&self) -> &[WorkerId] { &self.groups[self.current] }
    /// Number of completed rotations.
    pub fn round(&self) -> usize { self.round }
    /// Size of the largest group.
    pub fn max_group_size(&self) -> usize {
        self.groups.iter().map(|g| g.len()).max().unwrap_or(0)
    }

    fn in_current(&self, worker: WorkerId) -> bool {
        self.groups[self.current].contains(&worker)
    }

    /// True if `worker` should hold posted receive buffers.
    pub fn wants_buffers(&self, worker: WorkerId) -> bool {
        if !self.rotating {
            return !self.finished.contains(&worker);
        }
        self.in_current(worker) && !self.arrived.contains(&worker) && !self.finished.contains(&worker)
    }

    /// Records that a whole message from `worker` has arrived this round.
    pub fn mark_arrived(&mut self, worker: WorkerId) {
        if self.rotating {
            self.arrived.insert(worker);
        }
    }

    /// True if a message from `worker` may be delivered now.
    pub fn may_deliver(&self, worker: WorkerId) -> bool {
        !self.rotating || (self.in_current(worker) && !self.delivered.contains(&worker))
    }

    /// Records the delivery of a message from `worker`.
    pub fn record_completion(&mut self, worker: WorkerId) -> Result<()> {
        if !self.rotating {
            return Ok(());
        }
        if !self.in_current(worker) || !self.delivered.insert(worker) {
            return Err(CommsError::DuplicateGroupReceive { worker, group: self.current });
        }
        Ok(())
    }

    /// Records that `worker` will send nothing more.
    pub fn mark_finished(&mut self, worker: WorkerId) {
        self.finished.insert(worker);
    }

    /// True if every receiving worker has finished.
    pub fn all_finished(&self) -> bool {
        self.groups.iter().all(|g| g.iter().all(|w| self.finished.contains(w)))
    }

    /// True once every unfinished worker of the current group delivered this round.
    pub fn is_retired(&self) -> bool {
        self.rotating && self.groups[self.current].iter().all(|w| self.delivered.contains(w) || self.finished.contains(w))
    }

    /// Admits the next group with unfinished workers; false if nothing changed.
    pub fn advance(&mut self) -> bool {
        if !self.rotating || self.all_finished() {
            return false;
        }
        self.arrived.clear();
        self.delivered.clear();
        let count = self.groups.len();
        for step in 1 ..= count {
            let candidate = (self.current + step) % count;
            if self.groups[candidate].iter().any(|w| !self.finished.contains(w)) {
                self.current = candidate;
                break;
            }
        }
        self.round += 1;
        true
    }
}
