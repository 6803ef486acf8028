extern crate dataflow_channel;

use std::thread;
use std::time::Instant;

use structopt::StructOpt;

use dataflow_channel::ops::KeyedPartition;
use dataflow_channel::routing::{LogicalPlan, RoutingTable};
use dataflow_channel::transport::LocalFabric;
use dataflow_channel::{ChannelOperation, CommsConfig, MessageHeader, MessageReceiver, PartitionAlgorithm, Payload, TaskId};

#[derive(StructOpt, Debug, Clone)]
#[structopt(about = "Keyed partition across simulated workers over the in-process fabric")]
pub struct Opts {
    /// Number of simulated workers
    #[structopt(short, long, default_value = "4")]
    pub workers: usize,
    /// Tasks placed on each worker
    #[structopt(short, long, default_value = "2")]
    pub tasks: usize,
    /// Records sent by each task
    #[structopt(short, long, default_value = "100000")]
    pub records: u64,
    /// Records per submitted batch
    #[structopt(long, default_value = "1000")]
    pub batch: u64,
    /// Bytes per communication buffer
    #[structopt(long, default_value = "65536")]
    pub buffer_size: usize,
    /// Keyed partition algorithm, simple or ring
    #[structopt(long, default_value = "simple")]
    pub partition: PartitionAlgorithm,
}

/// Counts delivered records.
#[derive(Default)]
struct Counter {
    records: usize,
}

impl Counter {
    fn count(&mut self, payload: &Payload<(u64, u64)>) -> bool {
        self.records += payload.records().len();
        true
    }
}

impl MessageReceiver<(u64, u64)> for Counter {
    fn receive_message(&mut self, _target: TaskId, _header: &MessageHeader, payload: &Payload<(u64, u64)>) -> bool {
        self.count(payload)
    }
    fn receive_send_internally(&mut self, _source: TaskId, _target: TaskId, _flags: u32, payload: &Payload<(u64, u64)>) -> bool {
        self.count(payload)
    }
    fn sync(&mut self, _source: TaskId, _target: TaskId, _bytes: &[u8]) -> bool {
        true
    }
}

fn main() {
    let opts = Opts::from_args();
    let config = CommsConfig {
        buffer_size: opts.buffer_size,
        partition_algorithm: opts.partition,
        ..CommsConfig::default()
    };
    if let Err(error) = config.validate() {
        eprintln!("{}", error);
        ::std::process::exit(1);
    }

    let tasks = opts.workers * opts.tasks;
    let plan = (0 .. tasks).fold(LogicalPlan::new(0), |plan, task| plan.place(task, task / opts.tasks));
    let all: Vec<TaskId> = (0 .. tasks).collect();
    let fabric = LocalFabric::new(config.max_stash);

    println!("{}: starting {} workers", chrono::Local::now(), opts.workers);
    let timer = Instant::now();

    let handles: Vec<_> = (0 .. opts.workers).map(|worker| {
        let plan = plan.for_worker(worker);
        let all = all.clone();
        let fabric = fabric.clone();
        let config = config.clone();
        let opts = opts.clone();
        thread::spawn(move || -> Result<usize, String> {
            let routing = RoutingTable::new(plan, &all, &all).map_err(|e| e.to_string())?;
            let sources = routing.local_sources().to_vec();
            let operation = ChannelOperation::new(config, routing, 0, fabric.transport(worker), Counter::default())
                .map_err(|e| e.to_string())?;
            let mut partition = KeyedPartition::new(operation);

            let mut sent = vec![0u64; sources.len()];
            while sent.iter().any(|s| *s < opts.records) {
                for (index, &source) in sources.iter().enumerate() {
                    if sent[index] >= opts.records {
                        continue;
                    }
                    let upper = (sent[index] + opts.batch).min(opts.records);
                    let batch = (sent[index] .. upper).map(|i| (i * tasks as u64 + source as u64, i)).collect();
                    if partition.partition(source, batch, 0).map_err(|e| e.to_string())? {
                        sent[index] = upper;
                    }
                }
                partition.progress().map_err(|e| e.to_string())?;
            }
            for &source in sources.iter() {
                partition.finish(source).map_err(|e| e.to_string())?;
            }
            while partition.progress().map_err(|e| e.to_string())? { }
            let received = partition.receiver().records;
            partition.close().map_err(|e| e.to_string())?;
            Ok(received)
        })
    }).collect();

    let mut total = 0;
    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(received)) => {
                println!("worker {} received {} records", worker, received);
                total += received;
            }
            Ok(Err(error)) => println!("worker {} failed: {}", worker, error),
            Err(_) => println!("worker {} panicked", worker),
        }
    }

    let elapsed = timer.elapsed();
    let expected = tasks as u64 * opts.records;
    println!("{}: {} of {} records in {:?} ({:.0} records/s)",
        chrono::Local::now(), total, expected, elapsed, total as f64 / elapsed.as_secs_f64());
}
