#![allow(dead_code)]

use std::collections::VecDeque;

use dataflow_channel::header::HEADER_SIZE;
use dataflow_channel::routing::{LogicalPlan, RoutingTable};
use dataflow_channel::transport::{LocalFabric, LocalTransport};
use dataflow_channel::{ChannelOperation, CollectingReceiver, CommsConfig, Data, Destination, Payload, TaskId, WorkerId};

pub type Op<T> = ChannelOperation<T, LocalTransport, CollectingReceiver<T>>;

/// Small buffers and queues, so that messages span chunks and queues fill up.
pub fn small_config() -> CommsConfig {
    CommsConfig {
        buffer_size: HEADER_SIZE + 48,
        send_buffer_count: 4,
        receive_buffer_count: 2,
        send_pending_max: 4,
        receive_pending_max: 4,
        max_stash: 4,
        ..CommsConfig::default()
    }
}

pub fn plan(placement: &[(TaskId, WorkerId)]) -> LogicalPlan {
    placement.iter().fold(LogicalPlan::new(0), |plan, &(task, worker)| plan.place(task, worker))
}

/// One operation per worker, all on `edge`.
pub fn cluster<T: Data>(config: &CommsConfig, fabric: &LocalFabric, placement: &[(TaskId, WorkerId)], workers: usize, sources: &[TaskId], destinations: &[TaskId]) -> Vec<Op<T>> {
    let plan = plan(placement);
    (0 .. workers)
        .map(|worker| {
            let routing = RoutingTable::new(plan.for_worker(worker), sources, destinations).unwrap();
            ChannelOperation::new(config.clone(), routing, 3, fabric.transport(worker), CollectingReceiver::new()).unwrap()
        })
        .collect()
}

pub struct Submission<T> {
    pub source: TaskId,
    pub destination: Destination,
    pub payload: Payload<T>,
    pub flags: u32,
}

pub fn records<T>(source: TaskId, destination: Destination, records: Vec<T>) -> Submission<T> {
    Submission { source, destination, payload: Payload::Records(records), flags: 0 }
}

/// Submits each worker's script in order while driving every operation, until everything
/// was submitted and every operation is complete. `inspect` sees each operation after each step.
pub fn drive<T: Data, F: FnMut(&Op<T>)>(ops: &mut [Op<T>], mut scripts: Vec<VecDeque<Submission<T>>>, limit: usize, mut inspect: F) -> usize {
    scripts.resize_with(ops.len(), VecDeque::new);
    for step in 0 .. limit {
        for (op, script) in ops.iter_mut().zip(scripts.iter_mut()) {
            while script.front().map(|s| op.can_submit(s.source)).unwrap_or(false) {
                let next = script.pop_front().unwrap();
                assert!(op.submit(next.source, next.destination, next.payload, next.flags).unwrap());
            }
            op.progress().unwrap();
            inspect(op);
        }
        if scripts.iter().all(|s| s.is_empty()) && ops.iter().all(|o| o.is_complete()) {
            return step;
        }
    }
    panic!("operations did not complete within {} steps", limit);
}
