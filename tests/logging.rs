mod common;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use timely_logging::Logger;

use dataflow_channel::logging::{CommsEvent, CommsLogger, CommsSetup, StateEvent};
use dataflow_channel::transport::LocalFabric;
use dataflow_channel::Destination;

use common::{cluster, drive, records, small_config};

fn capture(worker: usize) -> (CommsLogger, Rc<RefCell<Vec<CommsEvent>>>) {
    let sink = Rc::new(RefCell::new(Vec::new()));
    let events = sink.clone();
    let setup = CommsSetup { worker, edge: 3, network: false };
    let logger = Logger::new(Instant::now(), Duration::default(), setup, move |_time, data: &mut Vec<(Duration, CommsSetup, CommsEvent)>| {
        events.borrow_mut().extend(data.drain(..).map(|(_, _, event)| event));
    });
    (logger, sink)
}

#[test]
fn operations_log_chunks_and_pools() {
    let config = small_config();
    let fabric = LocalFabric::new(config.max_stash);
    let mut ops = cluster::<u64>(&config, &fabric, &[(0, 0), (1, 1)], 2, &[0], &[1]);
    let mut loggers = Vec::new();
    let mut sinks = Vec::new();
    for (worker, op) in ops.iter_mut().enumerate() {
        let (logger, sink) = capture(worker);
        op.set_logger(Some(logger.clone()));
        loggers.push(logger);
        sinks.push(sink);
    }

    let script: VecDeque<_> = vec![records(0, Destination::Task(1), (0 .. 10u64).collect())].into_iter().collect();
    drive(&mut ops, vec![script], 1_000, |_| ());
    for op in ops.iter_mut() {
        op.close().unwrap();
    }
    for logger in loggers.iter_mut() {
        logger.flush();
    }

    let chunks = |worker: usize, send: bool| {
        sinks[worker].borrow().iter().filter(|e| match e {
            CommsEvent::Message(m) => m.is_send == send && m.peer == 1 - worker,
            _ => false,
        }).count()
    };
    assert!(chunks(0, true) >= 3);
    assert_eq!(chunks(0, true), chunks(1, false));
    assert_eq!(chunks(0, false), 0);

    for sink in sinks.iter() {
        let events = sink.borrow();
        assert_eq!(events.first(), Some(&CommsEvent::State(StateEvent { send: false, remote: None, start: true })));
        assert_eq!(events.last(), Some(&CommsEvent::State(StateEvent { send: false, remote: None, start: false })));
        // every buffer is back in its pool once closed
        for event in events.iter().rev().skip(1).take(2) {
            match event {
                CommsEvent::Buffer(b) => assert_eq!(b.free, b.total),
                other => panic!("expected a pool event, found {:?}", other),
            }
        }
    }
}
