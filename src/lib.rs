//! Buffer-managed channel operations exchanging typed records between dataflow tasks.
//!
//! Tasks are placed on workers by a [`LogicalPlan`](routing::LogicalPlan). A
//! [`ChannelOperation`] moves the messages of one dataflow edge: messages between tasks of the
//! same worker are handed over in memory, messages for other workers are streamed into chunks of
//! fixed-size pooled buffers and handed to a [`Transport`](transport::Transport). Incoming
//! chunks are rebuilt into messages and delivered to a [`MessageReceiver`].
//!
//! Operations never block. The owning thread calls `progress` until `is_complete`, and a full
//! queue or an exhausted pool shows up as `Ok(false)` rather than as waiting.
//!
//! To be communicated, a type must implement the [`Serialize`](serde::Serialize) trait when using
//! the `bincode` feature or the [`Abomonation`](abomonation::Abomonation) trait when not.
//!
//! # Examples
//! ```
//! use dataflow_channel::{ChannelOperation, CollectingReceiver, CommsConfig, Destination, Payload};
//! use dataflow_channel::routing::{LogicalPlan, RoutingTable};
//! use dataflow_channel::transport::LocalFabric;
//!
//! // two tasks on one worker.
//! let plan = LogicalPlan::new(0).place(0, 0).place(1, 0);
//! let routing = RoutingTable::new(plan, &[0], &[1]).unwrap();
//! let fabric = LocalFabric::new(8);
//! let mut operation = ChannelOperation::new(CommsConfig::default(), routing, 7, fabric.transport(0), CollectingReceiver::new()).unwrap();
//!
//! assert!(operation.submit(0, Destination::Task(1), Payload::Records(vec![1u64, 2, 3]), 0).unwrap());
//! while !operation.is_complete() {
//!     operation.progress().unwrap();
//! }
//! assert_eq!(operation.receiver().records(), vec![(0, 1, 1), (0, 1, 2), (0, 1, 3)]);
//! ```

#![forbid(missing_docs)]

extern crate abomonation;
#[macro_use] extern crate abomonation_derive;
#[cfg(feature = "bincode")]
extern crate bincode;
#[cfg(feature = "getopts")]
extern crate getopts;
extern crate timely_bytes as bytes;
extern crate timely_logging as logging_core;

use std::any::Any;

#[cfg(not(feature = "bincode"))]
use abomonation::Abomonation;
#[cfg(feature = "bincode")]
use serde::{Deserialize, Serialize};

pub use config::{CommsConfig, NetworkConfig, PartitionAlgorithm};
pub use error::{CommsError, Result};
pub use header::MessageHeader;
pub use message::{ChannelMessage, InMessage, OutMessage, Payload, ReceivedState, SendState};
pub use operation::{BufferStats, ChannelOperation};
pub use receiver::{CollectingReceiver, Delivery, MessageReceiver};
pub use routing::Destination;

pub mod buffer;
pub mod codec;
pub mod config;
pub mod deserializer;
pub mod error;
pub mod group;
pub mod header;
pub mod logging;
pub mod message;
pub mod operation;
pub mod ops;
pub mod progress;
pub mod receiver;
pub mod routing;
pub mod serializer;
pub mod transport;

/// Identifies a task of the dataflow.
pub type TaskId = usize;
/// Identifies a worker.
pub type WorkerId = usize;
/// Identifies an edge of the dataflow, and so a channel operation.
pub type EdgeId = usize;

/// A composite trait for types that may be used with channels.
#[cfg(not(feature = "bincode"))]
pub trait Data : Send+Sync+Any+Abomonation+Clone+'static { }
#[cfg(not(feature = "bincode"))]
impl<T: Send+Sync+Any+Abomonation+Clone+'static> Data for T { }

/// A composite trait for types that may be used with channels.
#[cfg(feature = "bincode")]
pub trait Data : Send+Sync+Any+Serialize+for<'a>Deserialize<'a>+Clone+'static { }
#[cfg(feature = "bincode")]
impl<T: Send+Sync+Any+Serialize+for<'a>Deserialize<'a>+Clone+'static> Data for T { }
