//! Placement of tasks on workers and the routes messages take.
//!
//! A route is internal when the destination task lives on this worker and the payload can be
//! handed over in memory, and external when the bytes have to travel to another worker.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CommsError, Result};
use crate::header::ALL_DESTINATIONS;
use crate::{TaskId, WorkerId};

pub mod selector;

pub use self::selector::{DestinationSelector, HashSelector, RingSelector, RoundRobinSelector};

/// The placement of tasks on workers, as seen from one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPlan {
    /// the worker this plan is used on.
    pub this_worker: WorkerId,
    /// the worker hosting each task.
    pub task_to_worker: BTreeMap<TaskId, WorkerId>,
}

impl LogicalPlan {
    /// A plan without tasks.
    pub fn new(this_worker: WorkerId) -> Self {
        LogicalPlan { this_worker, task_to_worker: BTreeMap::new() }
    }

    /// Places `task` on `worker`.
    pub fn place(mut self, task: TaskId, worker: WorkerId) -> Self {
        self.task_to_worker.insert(task, worker);
        self
    }

    /// The same placement, seen from `worker`.
    pub fn for_worker(&self, worker: WorkerId) -> Self {
        LogicalPlan { this_worker: worker, task_to_worker: self.task_to_worker.clone() }
    }

    /// The worker hosting `task`.
    pub fn worker_of(&self, task: TaskId) -> Option<WorkerId> {
        self.task_to_worker.get(&task).cloned()
    }

    /// Reads a plan from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| CommsError::Config(e.to_string()))
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// One destination task.
    Task(TaskId),
    /// Every destination task of the operation.
    All,
}

/// The routes one message takes from its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingParameters {
    /// destination tasks on this worker.
    pub internal_routes: Vec<TaskId>,
    /// other workers hosting destination tasks, ascending and without duplicates.
    pub external_routes: Vec<WorkerId>,
    /// the requested destination.
    pub destination: Destination,
}

impl RoutingParameters {
    /// The destination field of wire headers.
    pub fn header_destination(&self) -> i32 {
        match self.destination {
            Destination::Task(task) => task as i32,
            Destination::All => ALL_DESTINATIONS,
        }
    }
}

/// Routing information of one operation on one worker.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    plan: LogicalPlan,
    sources: Vec<TaskId>,
    destinations: Vec<TaskId>,
    local_sources: Vec<TaskId>,
    local_destinations: Vec<TaskId>,
    remote_sources: Vec<TaskId>,
    receiving_workers: Vec<WorkerId>,
    destination_workers: Vec<WorkerId>,
}

impl RoutingTable {
    /// Routing for an operation from `sources` to `destinations`.
    pub fn new(plan: LogicalPlan, sources: &[TaskId], destinations: &[TaskId]) -> Result<Self> {
        for &task in sources.iter().chain(destinations.iter()) {
            if plan.worker_of(task).is_none() {
                return Err(CommsError::UnplacedTask { task });
            }
        }

        let me = plan.this_worker;
        let on_worker = |task: &TaskId| plan.worker_of(*task) == Some(me);
        let sorted = |tasks: &[TaskId]| tasks.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();

        let sources = sorted(sources);
        let destinations = sorted(destinations);
        let local_sources: Vec<_> = sources.iter().cloned().filter(|t| on_worker(t)).collect();
        let local_destinations: Vec<_> = destinations.iter().cloned().filter(|t| on_worker(t)).collect();

        // nothing arrives at a worker without destinations.
        let remote_sources: Vec<_> = if local_destinations.is_empty() {
            Vec::new()
        }
        else {
            sources.iter().cloned().filter(|t| !on_worker(t)).collect()
        };
        let receiving_workers = remote_sources.iter()
            .filter_map(|t| plan.worker_of(*t))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let destination_workers = destinations.iter()
            .filter_map(|t| plan.worker_of(*t))
            .filter(|w| *w != me)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(RoutingTable {
            plan,
            sources,
            destinations,
            local_sources,
            local_destinations,
            remote_sources,
            receiving_workers,
            destination_workers,
        })
    }

    /// The worker this table routes for.
    pub fn this_worker(&self) -> WorkerId { self.plan.this_worker }
    /// The placement the table was built from.
    pub fn plan(&self) -> &LogicalPlan { &self.plan }
    /// Every source task, ascending.
    pub fn sources(&self) -> &[TaskId] { &self.sources }
    /// Every destination task, ascending.
    pub fn destinations(&self) -> &[TaskId] { &self.destinations }
    /// Source tasks hosted here.
    pub fn local_sources(&self) -> &[TaskId] { &self.local_sources }
    /// Destination tasks hosted here.
    pub fn local_destinations(&self) -> &[TaskId] { &self.local_destinations }
    /// Source tasks on other workers that may send here.
    pub fn remote_sources(&self) -> &[TaskId] { &self.remote_sources }
    /// Workers this worker receives from.
    pub fn receiving_workers(&self) -> &[WorkerId] { &self.receiving_workers }

    /// Remote source tasks hosted by `worker`.
    pub fn sources_on(&self, worker: WorkerId) -> impl Iterator<Item=TaskId> + '_ {
        self.remote_sources.iter().cloned().filter(move |t| self.plan.worker_of(*t) == Some(worker))
    }

    /// True if `task` is a destination hosted here.
    pub fn is_local_destination(&self, task: TaskId) -> bool {
        self.local_destinations.binary_search(&task).is_ok()
    }

    /// Splits the routes of a message from `source` to `destination`.
    pub fn routes(&self, source: TaskId, destination: Destination) -> Result<RoutingParameters> {
        if self.local_sources.binary_search(&source).is_err() {
            return Err(CommsError::UnknownSource { task: source });
        }
        let (internal_routes, external_routes) = match destination {
            Destination::Task(task) => {
                if self.destinations.binary_search(&task).is_err() {
                    return Err(CommsError::UnknownDestination { task });
                }
                match self.plan.worker_of(task) {
                    Some(worker) if worker == self.plan.this_worker => (vec![task], Vec::new()),
                    Some(worker) => (Vec::new(), vec![worker]),
                    None => return Err(CommsError::UnplacedTask { task }),
                }
            }
            Destination::All => (self.local_destinations.clone(), self.destination_workers.clone()),
        };
        Ok(RoutingParameters { internal_routes, external_routes, destination })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // tasks 0..4 on worker 0, 4..8 on worker 1, 8..10 on worker 2.
    fn plan(worker: WorkerId) -> LogicalPlan {
        (0..10).fold(LogicalPlan::new(worker), |plan, task| plan.place(task, (task / 4).min(2)))
    }

    #[test]
    fn splits_internal_and_external_routes() {
        let table = RoutingTable::new(plan(0), &[0, 1, 4], &[2, 3, 5, 8, 9]).unwrap();
        assert_eq!(table.local_sources(), &[0, 1]);
        assert_eq!(table.local_destinations(), &[2, 3]);
        assert_eq!(table.remote_sources(), &[4]);
        assert_eq!(table.receiving_workers(), &[1]);

        let all = table.routes(0, Destination::All).unwrap();
        assert_eq!(all.internal_routes, vec![2, 3]);
        assert_eq!(all.external_routes, vec![1, 2]);
        assert_eq!(all.header_destination(), ALL_DESTINATIONS);

        let one = table.routes(1, Destination::Task(9)).unwrap();
        assert!(one.internal_routes.is_empty());
        assert_eq!(one.external_routes, vec![2]);
        assert_eq!(one.header_destination(), 9);
    }

    #[test]
    fn rejects_unknown_tasks() {
        let table = RoutingTable::new(plan(1), &[0, 4], &[5]).unwrap();
        match table.routes(0, Destination::All) {
            Err(CommsError::UnknownSource { task }) => assert_eq!(task, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.routes(4, Destination::Task(6)).is_err());
        assert!(RoutingTable::new(plan(0), &[42], &[1]).is_err());
    }

    #[test]
    fn workers_without_destinations_receive_nothing() {
        let table = RoutingTable::new(plan(2), &[0, 4, 8], &[1, 5]).unwrap();
        assert!(table.remote_sources().is_empty());
        assert!(table.receiving_workers().is_empty());
    }

    #[test]
    fn plans_load_from_json() {
        let text = serde_json::to_string(&plan(1)).unwrap();
        let parsed: LogicalPlan = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.worker_of(9), Some(2));
        assert_eq!(parsed.this_worker, 1);
    }
}
