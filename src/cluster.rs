//! In-process multi-partition cluster.
//!
//! Every partition gets its own in-memory log and an inbox on a shared
//! local transport. The transport is wrapped in a `LossyTransport` so
//! tests can drop or intercept inter-partition messages, and time is a
//! `ControlledClock` that only moves through `increase_time`.
//!
//! The cluster is driven synchronously: `run_until_idle` steps every
//! partition in turn until a full round does no work.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, ControlledClock};
use crate::config::Config;
use crate::engine::{
    CommandResponse, EngineError, EngineState, Partition, PartitionOptions, ProcessorRegistry,
};
use crate::logstream::WriteFailure;
use crate::record::{LogAppendEntry, LogEntry, PartitionId};
use crate::storage::InMemoryLogStorage;
use crate::transport::{InterPartitionTransport, LocalTransport, LossyTransport};

/// Errors driving a local cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("No partition {0} in this cluster")]
    UnknownPartition(PartitionId),

    #[error("Partition {partition_id} failed: {source}")]
    Engine {
        partition_id: PartitionId,
        #[source]
        source: EngineError,
    },

    #[error("Command was not accepted: {0}")]
    Write(#[from] WriteFailure),

    #[error("Cluster still busy after {0} rounds")]
    NotIdle(usize),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Partitions of one process, driven by the caller.
pub struct LocalCluster {
    options: Vec<PartitionOptions>,
    max_idle_rounds: usize,
    clock: Arc<ControlledClock>,
    transport: Arc<LossyTransport<LocalTransport>>,
    registry: ProcessorRegistry,
    storages: Vec<Arc<InMemoryLogStorage>>,
    partitions: Vec<Partition>,
}

impl LocalCluster {
    pub fn new(config: &Config) -> Result<Self> {
        let partition_count = config.cluster.partition_count;
        let clock = Arc::new(ControlledClock::new(0));
        let transport = Arc::new(LossyTransport::passthrough(LocalTransport::new()));
        let registry = ProcessorRegistry::standard();

        let options: Vec<PartitionOptions> = (1..=partition_count)
            .map(|partition_id| PartitionOptions {
                partition_id,
                partition_count,
                log_stream: config.log_stream.clone(),
                distribution: config.distribution.clone(),
            })
            .collect();
        let storages: Vec<Arc<InMemoryLogStorage>> = options
            .iter()
            .map(|_| Arc::new(InMemoryLogStorage::new()))
            .collect();

        let mut cluster = Self {
            options,
            max_idle_rounds: config.cluster.max_idle_rounds,
            clock,
            transport,
            registry,
            storages,
            partitions: Vec::with_capacity(partition_count as usize),
        };
        for partition_id in 1..=partition_count {
            let partition = cluster.open_partition(partition_id)?;
            cluster.partitions.push(partition);
        }

        info!(partition_count, "Local cluster started");
        Ok(cluster)
    }

    /// Cluster with default settings and `partition_count` partitions.
    pub fn with_partitions(partition_count: u32) -> Result<Self> {
        let mut config = Config::for_test();
        config.cluster.partition_count = partition_count;
        Self::new(&config)
    }

    fn open_partition(&self, partition_id: PartitionId) -> Result<Partition> {
        let index = self.index(partition_id)?;
        let transport: Arc<dyn InterPartitionTransport> = self.transport.clone();
        let clock: Arc<dyn Clock> = self.clock.clone();
        Partition::open(
            &self.options[index],
            self.storages[index].clone(),
            transport,
            self.transport.inner().register(partition_id),
            clock,
            self.registry.clone(),
        )
        .map_err(|source| ClusterError::Engine {
            partition_id,
            source,
        })
    }

    fn index(&self, partition_id: PartitionId) -> Result<usize> {
        let index = (partition_id as usize)
            .checked_sub(1)
            .filter(|index| *index < self.options.len())
            .ok_or(ClusterError::UnknownPartition(partition_id))?;
        Ok(index)
    }

    fn partition(&self, partition_id: PartitionId) -> Result<&Partition> {
        let index = self.index(partition_id)?;
        self.partitions
            .get(index)
            .ok_or(ClusterError::UnknownPartition(partition_id))
    }

    pub fn partition_count(&self) -> u32 {
        self.options.len() as u32
    }

    /// Write a user command to `partition_id`. Returns its position.
    pub fn submit(&self, partition_id: PartitionId, command: LogAppendEntry) -> Result<i64> {
        Ok(self.partition(partition_id)?.submit(command)?)
    }

    /// Step every partition until a whole round does no work.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        for round in 1..=self.max_idle_rounds {
            let mut progressed = false;
            for partition in &mut self.partitions {
                let partition_id = partition.partition_id();
                progressed |= partition
                    .step()
                    .map_err(|source| ClusterError::Engine {
                        partition_id,
                        source,
                    })?;
            }
            if !progressed {
                debug!(rounds = round, "Cluster idle");
                return Ok(round);
            }
        }
        warn!(rounds = self.max_idle_rounds, "Cluster did not become idle");
        Err(ClusterError::NotIdle(self.max_idle_rounds))
    }

    /// Advance the logical clock of every partition.
    pub fn increase_time(&self, by: Duration) -> i64 {
        self.clock.increase_time(by)
    }

    pub fn clock(&self) -> &Arc<ControlledClock> {
        &self.clock
    }

    /// The transport between partitions, for dropping or intercepting
    /// messages.
    pub fn transport(&self) -> &LossyTransport<LocalTransport> {
        &self.transport
    }

    pub fn storage(&self, partition_id: PartitionId) -> Result<Arc<InMemoryLogStorage>> {
        Ok(self.storages[self.index(partition_id)?].clone())
    }

    /// Every committed record of a partition's log.
    pub fn records(&self, partition_id: PartitionId) -> Result<Vec<LogEntry>> {
        self.partition(partition_id)?
            .records()
            .map_err(|source| ClusterError::Engine {
                partition_id,
                source,
            })
    }

    pub fn state(&self, partition_id: PartitionId) -> Result<&EngineState> {
        Ok(self.partition(partition_id)?.state())
    }

    /// Take the response to a user command.
    pub fn response(&self, partition_id: PartitionId, position: i64) -> Result<Option<CommandResponse>> {
        Ok(self.partition(partition_id)?.take_response(position))
    }

    /// Responses of a partition that no client has taken yet.
    pub fn unclaimed_responses(&self, partition_id: PartitionId) -> Result<usize> {
        Ok(self.partition(partition_id)?.responses().len())
    }

    /// Close a partition and open it again over the same log, as after a
    /// crash. In-memory state is rebuilt by replay.
    pub fn restart_partition(&mut self, partition_id: PartitionId) -> Result<()> {
        let index = self.index(partition_id)?;
        self.partitions[index].close();
        let partition = self.open_partition(partition_id)?;
        self.partitions[index] = partition;
        info!(partition_id, "Partition restarted");
        Ok(())
    }
}
