mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use dataflow_channel::ops::Partition;
use dataflow_channel::routing::RoutingTable;
use dataflow_channel::transport::tcp::{LogFn, TcpTransport};
use dataflow_channel::{ChannelOperation, CollectingReceiver};

use common::{plan, small_config};

#[test]
fn partition_over_localhost() {
    let listeners: Vec<TcpListener> = (0 .. 2).map(|_| TcpListener::bind("127.0.0.1:0").unwrap()).collect();
    let addresses: Vec<String> = listeners.iter().map(|l| l.local_addr().unwrap().to_string()).collect();
    let records: Vec<String> = (0 .. 40).map(|i| format!("record {:03} {}", i, "t".repeat(i % 17))).collect();

    let handles: Vec<_> = listeners.into_iter().enumerate().map(|(worker, listener)| {
        let addresses = addresses.clone();
        let records = records.clone();
        thread::spawn(move || {
            let log_fn: LogFn = Arc::new(|_| None);
            let transport = TcpTransport::connect(worker, listener, addresses, log_fn).unwrap();
            assert_eq!(transport.index(), worker);

            let routing = RoutingTable::new(plan(&[(0, 0), (1, 1)]).for_worker(worker), &[0], &[1]).unwrap();
            let operation = ChannelOperation::new(small_config(), routing, 5, transport.clone(), CollectingReceiver::<String>::new()).unwrap();
            let mut partition = Partition::new(operation);

            let mut queued = records.chunks(3).map(|c| c.to_vec()).peekable();
            let mut steps = 0u64;
            loop {
                if worker == 0 {
                    if let Some(batch) = queued.peek() {
                        if partition.partition(0, 1, batch.clone(), 0).unwrap() {
                            queued.next();
                            if queued.peek().is_none() {
                                partition.finish(0).unwrap();
                            }
                        }
                    }
                }
                if !partition.progress().unwrap() {
                    break;
                }
                steps += 1;
                assert!(steps < 50_000_000, "worker {} did not complete", worker);
                thread::yield_now();
            }

            let received: Vec<String> = partition.collective().operation().receiver().records().into_iter().map(|r| r.2).collect();
            partition.close().unwrap();
            transport.shutdown();
            received
        })
    }).collect();

    let results: Vec<Vec<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results[0].is_empty());
    assert_eq!(results[1], records);
}
