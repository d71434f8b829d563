//! tidelog-standalone: all partitions in one process
//!
//! Runs every configured partition on its own tokio task over in-memory
//! logs, connected by the in-process transport. Group names passed as
//! arguments are created on partition 1 and distributed to the others.
//!
//! ## Configuration
//! ```yaml
//! cluster:
//!   partition_count: 3
//!   tick_interval_ms: 100
//! log_stream:
//!   flow_control:
//!     request_limit:
//!       algorithm: aimd
//!       initial_limit: 100
//! distribution:
//!   redistribution_interval_ms: 10000
//! ```
//!
//! ```text
//! TIDELOG_CONFIG=tidelog.yaml TIDELOG_LOG=debug tidelog-standalone ops dev
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use tidelog::clock::{Clock, SystemClock};
use tidelog::config::Config;
use tidelog::engine::{
    CommandResponse, Partition, PartitionOptions, PartitionRuntime, ProcessorRegistry,
};
use tidelog::identity::GroupRecord;
use tidelog::record::{GroupIntent, LogAppendEntry, NO_POSITION};
use tidelog::storage::InMemoryLogStorage;
use tidelog::transport::{InterPartitionTransport, LocalTransport};
use tidelog::utils::bootstrap::init_tracing;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let partition_count = config.cluster.partition_count;
    let tick_interval = Duration::from_millis(config.cluster.tick_interval_ms);

    let transport = Arc::new(LocalTransport::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = ProcessorRegistry::standard();

    let mut handles = Vec::with_capacity(partition_count as usize);
    for partition_id in 1..=partition_count {
        let options = PartitionOptions {
            partition_id,
            partition_count,
            log_stream: config.log_stream.clone(),
            distribution: config.distribution.clone(),
        };
        let dyn_transport: Arc<dyn InterPartitionTransport> = transport.clone();
        let partition = Partition::open(
            &options,
            Arc::new(InMemoryLogStorage::new()),
            dyn_transport,
            transport.register(partition_id),
            Arc::clone(&clock),
            registry.clone(),
        )?;
        handles.push(PartitionRuntime::spawn(partition, tick_interval));
    }
    info!(partition_count, "All partitions running");

    if let Some(origin) = handles.first() {
        for name in std::env::args().skip(1) {
            let command = LogAppendEntry::command(
                NO_POSITION,
                GroupIntent::Create,
                &GroupRecord::named(name.clone()),
            )?;
            let position = match origin.submit(command) {
                Ok(position) => position,
                Err(e) => {
                    warn!(name = %name, error = %e, "Group create was not accepted");
                    continue;
                }
            };
            match origin.response(position, RESPONSE_TIMEOUT).await {
                Some(CommandResponse::Event { key, .. }) => {
                    info!(name = %name, key, "Group created")
                }
                Some(CommandResponse::Rejected(rejection)) => {
                    warn!(name = %name, reason = %rejection.reason, "Group create rejected")
                }
                None => error!(name = %name, "No response to group create"),
            }
        }
    }

    info!("tidelog standalone running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    for handle in handles {
        handle.shutdown().await;
    }
    info!("Shut down");
    Ok(())
}
