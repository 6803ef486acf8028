//! Configuration of channel operations and of the network.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::LENGTH_PREFIX;
use crate::error::{CommsError, Result};
use crate::header::HEADER_SIZE;

/// How keyed operations choose destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionAlgorithm {
    /// hash of the key modulo the destinations.
    Simple,
    /// consistent hashing over a ring of virtual nodes.
    Ring,
}

impl FromStr for PartitionAlgorithm {
    type Err = String;
    fn from_str(s: &str) -> ::std::result::Result<Self, String> {
        match s {
            "simple" => Ok(PartitionAlgorithm::Simple),
            "ring" => Ok(PartitionAlgorithm::Ring),
            other => Err(format!("unknown partition algorithm: {}", other)),
        }
    }
}

/// Buffer and queue sizes of a channel operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// bytes per buffer, header included.
    pub buffer_size: usize,
    /// buffers in the send pool.
    pub send_buffer_count: usize,
    /// buffers posted to each admitted receiving worker.
    pub receive_buffer_count: usize,
    /// messages queued per local source before submits are refused.
    pub send_pending_max: usize,
    /// messages queued per remote source before its worker stops receiving.
    pub receive_pending_max: usize,
    /// destination choice of keyed operations.
    pub partition_algorithm: PartitionAlgorithm,
    /// ring points per destination for [`PartitionAlgorithm::Ring`].
    pub ring_virtual_nodes: usize,
    /// chunks an in-process link holds for a receiver without posted buffers.
    pub max_stash: usize,
}

impl Default for CommsConfig {
    fn default() -> Self {
        CommsConfig {
            buffer_size: 1 << 16,
            send_buffer_count: 32,
            receive_buffer_count: 8,
            send_pending_max: 16,
            receive_pending_max: 32,
            partition_algorithm: PartitionAlgorithm::Simple,
            ring_virtual_nodes: 64,
            max_stash: 64,
        }
    }
}

impl CommsConfig {
    /// Checks that every size allows progress.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < HEADER_SIZE + LENGTH_PREFIX + 1 {
            return Err(CommsError::Config(format!("buffer size {} leaves no room after the {} byte header", self.buffer_size, HEADER_SIZE)));
        }
        let counts = [
            ("send_buffer_count", self.send_buffer_count),
            ("receive_buffer_count", self.receive_buffer_count),
            ("send_pending_max", self.send_pending_max),
            ("receive_pending_max", self.receive_pending_max),
            ("ring_virtual_nodes", self.ring_virtual_nodes),
            ("max_stash", self.max_stash),
        ];
        for (name, value) in counts.iter() {
            if *value == 0 {
                return Err(CommsError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Reads a configuration from a JSON file; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = ::std::fs::File::open(path)?;
        let reader = ::std::io::BufReader::new(file);
        let config: CommsConfig = serde_json::from_reader(reader).map_err(|e| CommsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Installs options into a [`getopts::Options`] struct that correspond
    /// to the parameters in the configuration.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("", "comms-config", "JSON file with communication settings", "FILE");
        opts.optopt("", "buffer-size", "bytes per communication buffer", "BYTES");
        opts.optopt("", "send-buffers", "buffers in each send pool", "NUM");
        opts.optopt("", "receive-buffers", "buffers posted per receiving worker", "NUM");
        opts.optopt("", "send-pending", "queued messages per source", "NUM");
        opts.optopt("", "receive-pending", "queued received messages per source", "NUM");
        opts.optopt("", "partition", "keyed partition algorithm (simple or ring)", "ALGO");
    }

    /// Instantiates a configuration based upon the parsed options in `matches`.
    ///
    /// Options override the file given with `--comms-config`, which overrides the defaults.
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> ::std::result::Result<CommsConfig, String> {
        let base = match matches.opt_str("comms-config") {
            Some(path) => CommsConfig::from_json_file(path).map_err(|e| e.to_string())?,
            None => CommsConfig::default(),
        };
        let config = CommsConfig {
            buffer_size: matches.opt_get_default("buffer-size", base.buffer_size).map_err(|e| e.to_string())?,
            send_buffer_count: matches.opt_get_default("send-buffers", base.send_buffer_count).map_err(|e| e.to_string())?,
            receive_buffer_count: matches.opt_get_default("receive-buffers", base.receive_buffer_count).map_err(|e| e.to_string())?,
            send_pending_max: matches.opt_get_default("send-pending", base.send_pending_max).map_err(|e| e.to_string())?,
            receive_pending_max: matches.opt_get_default("receive-pending", base.receive_pending_max).map_err(|e| e.to_string())?,
            partition_algorithm: matches.opt_get_default("partition", base.partition_algorithm)?,
            ..base
        };
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Constructs a new configuration by parsing the supplied text arguments.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: Iterator<Item=String>>(args: I) -> ::std::result::Result<CommsConfig, String> {
        let mut opts = getopts::Options::new();
        CommsConfig::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| e.to_string())?;
        CommsConfig::from_matches(&matches)
    }
}

/// Addresses of the worker processes of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// index of this worker process.
    #[serde(default)]
    pub process: usize,
    /// address of every worker process, indexed by process.
    pub peer_workers_addrs: Vec<String>,
    /// print connection progress.
    #[serde(default)]
    pub report: bool,
}

impl NetworkConfig {
    /// Reads the addresses from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = ::std::fs::File::open(path)?;
        let reader = ::std::io::BufReader::new(file);
        let config: NetworkConfig = serde_json::from_reader(reader).map_err(|e| CommsError::Config(e.to_string()))?;
        if config.process >= config.peer_workers_addrs.len() {
            return Err(CommsError::Config(format!("process {} of {} addresses", config.process, config.peer_workers_addrs.len())));
        }
        Ok(config)
    }
}
