mod common;

use std::collections::VecDeque;

use dataflow_channel::header::flags;
use dataflow_channel::transport::LocalFabric;
use dataflow_channel::{CommsError, Destination, Payload};

use common::{cluster, drive, records, small_config, Submission};

// task 0 on worker 0 receives from one source task on each of workers 1, 2 and 3.
const PLACEMENT: &[(usize, usize)] = &[(0, 0), (1, 1), (2, 2), (3, 3)];

fn scripts(messages: u64) -> Vec<VecDeque<Submission<u64>>> {
    let mut scripts: Vec<VecDeque<Submission<u64>>> = (0 .. 4).map(|_| VecDeque::new()).collect();
    for source in 1 .. 4usize {
        for seq in 0 .. messages {
            scripts[source].push_back(records(source, Destination::Task(0), vec![source as u64 * 100 + seq; 5]));
        }
        scripts[source].push_back(Submission { source, destination: Destination::All, payload: Payload::Records(vec![]), flags: flags::LAST });
    }
    scripts
}

#[test]
fn groups_deliver_one_message_per_worker_and_round() {
    let fabric = LocalFabric::new(16);
    let mut ops = cluster::<u64>(&small_config(), &fabric, PLACEMENT, 4, &[1, 2, 3], &[0]);
    ops[0].setup_receive_groups(1, vec![vec![1, 3], vec![2]]).unwrap();

    drive(&mut ops, scripts(4), 20_000, |op| {
        if op.routing().this_worker() == 0 {
            assert!(op.buffer_stats().is_conserved());
            // buffers for at most one group of two workers
            assert!(op.buffer_stats().receive_total == 2 * small_config().receive_buffer_count);
        }
    });

    let sources: Vec<usize> = ops[0].receiver().deliveries().iter().map(|d| d.source).collect();
    assert_eq!(sources.len(), 3 * 5);
    // the initial group holds worker 2 alone, then workers 1 and 3 deliver once each
    for (round, window) in sources.chunks(3).enumerate() {
        assert_eq!(window[0], 2, "round {}: {:?}", round, sources);
        let mut rest = window[1 ..].to_vec();
        rest.sort();
        assert_eq!(rest, vec![1, 3], "round {}: {:?}", round, sources);
    }

    let groups = ops[0].receive_groups();
    assert!(groups.all_finished());
    assert!(groups.round() >= 9);
    assert!(ops[0].all_sources_finished());
}

#[test]
fn groups_keep_per_source_order() {
    let fabric = LocalFabric::new(16);
    let mut ops = cluster::<u64>(&small_config(), &fabric, PLACEMENT, 4, &[1, 2, 3], &[0]);
    ops[0].setup_receive_groups(0, vec![vec![1], vec![2], vec![3]]).unwrap();
    drive(&mut ops, scripts(6), 20_000, |_| ());

    for source in 1 .. 4 {
        let values: Vec<u64> = ops[0].receiver().records().into_iter().filter(|r| r.0 == source).map(|r| r.2).collect();
        let expected: Vec<u64> = (0 .. 6).flat_map(|seq| vec![source as u64 * 100 + seq; 5]).collect();
        assert_eq!(values, expected);
    }
}

#[test]
fn groups_must_partition_the_receiving_workers() {
    let fabric = LocalFabric::new(16);
    let mut ops = cluster::<u64>(&small_config(), &fabric, PLACEMENT, 4, &[1, 2, 3], &[0]);
    assert!(matches!(ops[0].setup_receive_groups(0, vec![vec![1, 2]]), Err(CommsError::InvalidGroups(_))));
    assert!(matches!(ops[0].setup_receive_groups(0, vec![vec![1, 2], vec![2, 3]]), Err(CommsError::InvalidGroups(_))));
    assert!(matches!(ops[0].setup_receive_groups(3, vec![vec![1, 2, 3]]), Err(CommsError::InvalidGroups(_))));
    // a worker that receives nothing has no groups to form
    assert!(ops[1].setup_receive_groups(0, vec![vec![0]]).is_err());
    ops[0].setup_receive_groups(0, vec![vec![3], vec![2, 1]]).unwrap();
}
