mod common;

use std::collections::{BTreeMap, VecDeque};

use dataflow_channel::buffer::DataBuffer;
use dataflow_channel::header::flags;
use dataflow_channel::routing::RoutingTable;
use dataflow_channel::transport::{LocalFabric, Transport};
use dataflow_channel::{ChannelOperation, CollectingReceiver, CommsConfig, CommsError, Destination, Payload};

use common::{cluster, drive, plan, records, small_config, Submission};

const PLACEMENT: &[(usize, usize)] = &[(0, 0), (1, 0), (2, 1), (3, 1), (4, 2), (5, 0)];

#[test]
fn messages_of_a_source_arrive_in_order() {
    let fabric = LocalFabric::new(4);
    let mut ops = cluster::<(u64, String)>(&small_config(), &fabric, PLACEMENT, 3, &[0, 1, 2], &[3, 4, 5]);

    let mut scripts = vec![VecDeque::new(), VecDeque::new(), VecDeque::new()];
    for seq in 0 .. 12u64 {
        for &(source, worker) in &[(0usize, 0usize), (1, 0), (2, 1)] {
            let destination = if seq % 3 == 0 { Destination::All } else { Destination::Task(3 + (seq as usize % 3)) };
            let payload = (0 .. seq % 4).map(|i| (seq, "x".repeat((seq * 7 + i) as usize))).collect();
            scripts[worker].push_back(records(source, destination, payload));
        }
    }
    drive(&mut ops, scripts, 10_000, |_| ());

    let mut seen: BTreeMap<(usize, usize), Vec<u64>> = BTreeMap::new();
    for op in ops.iter() {
        for delivery in op.receiver().deliveries() {
            let seqs: Vec<u64> = delivery.payload.records().iter().map(|r| r.0).collect();
            seen.entry((delivery.source, delivery.target)).or_insert_with(Vec::new).extend(seqs);
        }
    }
    for (link, seqs) in seen.iter() {
        assert!(seqs.windows(2).all(|w| w[0] <= w[1]), "out of order on {:?}: {:?}", link, seqs);
    }
    // messages to all (seq 0, 3, 6, 9 with 0, 3, 2, 1 records) reach every destination
    for source in 0 .. 3 {
        for target in 3 .. 6 {
            let count = seen.get(&(source, target)).map(|s| s.iter().filter(|seq| **seq % 3 == 0).count()).unwrap_or(0);
            assert_eq!(count, 6, "source {} target {}", source, target);
        }
    }
    // the rest went to one destination each
    let addressed: usize = seen.values().map(|s| s.iter().filter(|seq| **seq % 3 != 0).count()).sum();
    let expected: u64 = (0 .. 12u64).filter(|seq| seq % 3 != 0).map(|seq| seq % 4).sum();
    assert_eq!(addressed, 3 * expected as usize);
}

#[test]
fn chunked_messages_rebuild_exactly() {
    let fabric = LocalFabric::new(4);
    let mut ops = cluster::<(u64, String)>(&small_config(), &fabric, &[(0, 0), (1, 1)], 2, &[0], &[1]);
    let payload: Vec<(u64, String)> = (0 .. 40).map(|i| (i, "record".repeat(i as usize % 9))).collect();

    let script = vec![records(0, Destination::Task(1), payload.clone())].into_iter().collect();
    drive(&mut ops, vec![script], 10_000, |_| ());

    let receiver = ops[1].receiver();
    assert_eq!(receiver.deliveries().len(), 1);
    assert_eq!(receiver.deliveries()[0].payload, Payload::Records(payload));
    assert!(receiver.chunks() > 10, "only {} chunks", receiver.chunks());
}

#[test]
fn buffers_are_conserved() {
    let fabric = LocalFabric::new(2);
    let mut ops = cluster::<(u64, String)>(&small_config(), &fabric, PLACEMENT, 3, &[0, 1, 2], &[3, 4, 5]);
    let mut scripts = vec![VecDeque::new(), VecDeque::new(), VecDeque::new()];
    for seq in 0 .. 8u64 {
        scripts[0].push_back(records(0, Destination::All, vec![(seq, "y".repeat(seq as usize * 11))]));
        scripts[1].push_back(records(2, Destination::Task(5), vec![(seq, "z".repeat(30)); 3]));
    }

    let mut checks = 0;
    drive(&mut ops, scripts, 10_000, |op| {
        let stats = op.buffer_stats();
        assert!(stats.is_conserved(), "{:?}", stats);
        checks += 1;
    });
    assert!(checks > 0);

    for op in ops.iter_mut() {
        op.close().unwrap();
        let stats = op.buffer_stats();
        assert_eq!(stats.send_free, stats.send_total);
        assert_eq!(stats.receive_free, stats.receive_total);
    }
}

#[test]
fn full_queues_refuse_without_side_effects() {
    let config = CommsConfig { send_pending_max: 2, ..small_config() };
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 0)]), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut op = ChannelOperation::new(config, routing, 1, fabric.transport(0), CollectingReceiver::new()).unwrap();

    assert!(op.submit(0, Destination::Task(1), Payload::Single(1u64), 0).unwrap());
    assert!(op.submit(0, Destination::Task(1), Payload::Single(2u64), 0).unwrap());
    assert!(!op.can_submit(0));
    assert!(!op.submit(0, Destination::Task(1), Payload::Single(3u64), 0).unwrap());

    while !op.is_complete() {
        op.progress().unwrap();
    }
    let delivered: Vec<_> = op.receiver().records().into_iter().map(|r| r.2).collect();
    assert_eq!(delivered, vec![1, 2]);
    assert!(op.submit(0, Destination::Task(1), Payload::Single(3u64), 0).unwrap());
}

#[test]
fn refused_deliveries_are_offered_again() {
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 0), (2, 1)]), &[0, 2], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut local = ChannelOperation::new(small_config(), routing, 1, fabric.transport(0), CollectingReceiver::with_capacity(1)).unwrap();
    let remote_routing = RoutingTable::new(plan(&[(0, 0), (1, 0), (2, 1)]).for_worker(1), &[0, 2], &[1]).unwrap();
    let mut remote = ChannelOperation::new(small_config(), remote_routing, 1, fabric.transport(1), CollectingReceiver::new()).unwrap();

    assert!(local.submit(0, Destination::Task(1), Payload::Records(vec![10u64]), 0).unwrap());
    assert!(local.submit(0, Destination::Task(1), Payload::Records(vec![11u64]), 0).unwrap());
    assert!(remote.submit(2, Destination::Task(1), Payload::Records(vec![20u64]), 0).unwrap());

    for _ in 0 .. 50 {
        local.progress().unwrap();
        remote.progress().unwrap();
    }
    assert_eq!(local.receiver().deliveries().len(), 1);
    assert!(!local.is_complete());

    let mut delivered = Vec::new();
    for _ in 0 .. 200 {
        delivered.extend(local.receiver_mut().take().into_iter().flat_map(|d| d.payload.records().to_vec()));
        local.progress().unwrap();
        remote.progress().unwrap();
        if local.is_complete() && remote.is_complete() {
            break;
        }
    }
    delivered.extend(local.receiver_mut().take().into_iter().flat_map(|d| d.payload.records().to_vec()));
    assert!(local.is_complete());

    let from_local: Vec<_> = delivered.iter().cloned().filter(|r| *r < 20).collect();
    assert_eq!(from_local, vec![10, 11]);
    assert!(delivered.contains(&20));
    assert_eq!(delivered.len(), 3);
}

#[test]
fn barriers_carry_raw_bytes_on_a_typed_edge() {
    let fabric = LocalFabric::new(4);
    let mut ops = cluster::<String>(&small_config(), &fabric, &[(0, 0), (1, 0), (2, 1)], 2, &[0], &[1, 2]);
    let script = vec![
        records(0, Destination::All, vec!["before".to_string()]),
        Submission { source: 0, destination: Destination::All, payload: Payload::Raw(vec![7; 100]), flags: 0 },
        // the barrier flag is dropped from typed payloads
        Submission { source: 0, destination: Destination::All, payload: Payload::Records(vec!["after".to_string()]), flags: flags::SYNC_BARRIER },
    ].into_iter().collect();
    drive(&mut ops, vec![script], 10_000, |_| ());

    for (op, target) in ops.iter().zip(&[1usize, 2]) {
        let deliveries = op.receiver().deliveries();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.target == *target));
        assert_eq!(deliveries[1].payload, Payload::Raw(vec![7; 100]));
        assert!(deliveries[1].flags & flags::SYNC_BARRIER != 0);
        assert!(deliveries[2].flags & flags::SYNC_BARRIER == 0);
        let records: Vec<_> = op.receiver().records().into_iter().map(|r| r.2).collect();
        assert_eq!(records, vec!["before".to_string(), "after".to_string()]);
    }
}

#[test]
fn unknown_sources_abort_the_operation() {
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 1)]), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut op = ChannelOperation::<u64, _, _>::new(small_config(), routing, 1, fabric.transport(0), CollectingReceiver::<u64>::new()).unwrap();

    match op.submit(1, Destination::Task(1), Payload::Single(5), 0) {
        Err(CommsError::UnknownSource { task }) => assert_eq!(task, 1),
        other => panic!("unexpected {:?}", other),
    }
    assert!(op.is_aborted());
    match op.progress() {
        Err(CommsError::Aborted) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn malformed_chunks_and_tickets_are_fatal() {
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 1)]), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let receiving_routing = RoutingTable::new(plan(&[(0, 0), (1, 1)]).for_worker(1), &[0], &[1]).unwrap();
    let mut receiving = ChannelOperation::<u64, _, _>::new(small_config(), receiving_routing, 1, fabric.transport(1), CollectingReceiver::<u64>::new()).unwrap();
    let mut garbage = DataBuffer::new(64);
    garbage.set_size(10);
    match receiving.on_buffer_filled(garbage, 0) {
        Err(CommsError::MalformedChunk { edge, .. }) => assert_eq!(edge, 1),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(receiving.progress(), Err(CommsError::Aborted)));

    let mut sending = ChannelOperation::<u64, _, _>::new(small_config(), routing, 1, fabric.transport(0), CollectingReceiver::<u64>::new()).unwrap();
    assert!(matches!(sending.on_send_acknowledged(99), Err(CommsError::UnknownTicket { ticket: 99 })));
}

#[test]
fn oversized_chunks_abort_and_return_their_buffer() {
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 1)]).for_worker(1), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut op = ChannelOperation::<u64, _, _>::new(small_config(), routing, 1, fabric.transport(1), CollectingReceiver::<u64>::new()).unwrap();
    op.progress().unwrap();

    let (acks, _ack_events) = crossbeam_channel::unbounded();
    let mut peer = fabric.transport(0);
    assert!(peer.send_message(1, 1, 0, &[0u8; 500], &acks));

    match op.progress() {
        Err(CommsError::OversizedChunk { worker, length, capacity }) => {
            assert_eq!(worker, 0);
            assert_eq!(length, 500);
            assert_eq!(capacity, small_config().buffer_size);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(op.is_aborted());
    op.close().unwrap();
    let stats = op.buffer_stats();
    assert!(stats.is_conserved(), "{:?}", stats);
    assert_eq!(stats.receive_free, stats.receive_total);
}

#[test]
fn groups_must_precede_the_first_progress() {
    let routing = RoutingTable::new(plan(&[(0, 1), (1, 0)]).for_worker(0), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut op = ChannelOperation::<u64, _, _>::new(small_config(), routing, 1, fabric.transport(0), CollectingReceiver::<u64>::new()).unwrap();
    op.progress().unwrap();
    assert!(matches!(op.setup_receive_groups(0, vec![vec![1]]), Err(CommsError::GroupsAfterStart)));
    // not fatal
    op.progress().unwrap();
}

#[test]
fn full_stashes_hold_chunks_at_the_sender() {
    let fabric = LocalFabric::new(1);
    let mut ops = cluster::<u64>(&small_config(), &fabric, &[(0, 0), (1, 1)], 2, &[0], &[1]);
    for value in 0 .. 3u64 {
        assert!(ops[0].submit(0, Destination::Task(1), Payload::Single(value), 0).unwrap());
    }
    for _ in 0 .. 20 {
        ops[0].progress().unwrap();
    }
    assert!(!ops[0].is_complete());
    assert!(ops[0].buffer_stats().send_in_flight > 0 || ops[0].buffer_stats().send_free < ops[0].buffer_stats().send_total);

    drive(&mut ops, Vec::new(), 1_000, |_| ());
    let delivered: Vec<_> = ops[1].receiver().records().into_iter().map(|r| r.2).collect();
    assert_eq!(delivered, vec![0, 1, 2]);
}

#[test]
fn closed_operations_refuse_work() {
    let routing = RoutingTable::new(plan(&[(0, 0), (1, 0)]), &[0], &[1]).unwrap();
    let fabric = LocalFabric::new(4);
    let mut op = ChannelOperation::<u64, _, _>::new(small_config(), routing, 1, fabric.transport(0), CollectingReceiver::<u64>::new()).unwrap();
    op.close().unwrap();
    assert!(matches!(op.submit(0, Destination::Task(1), Payload::Single(1), 0), Err(CommsError::Closed)));
    assert!(matches!(op.progress(), Err(CommsError::Closed)));
    assert!(!op.is_aborted());
}
