//! Tidelog - partitioned log and command distribution core
//!
//! Infrastructure for an event-sourced engine split into partitions. Each
//! partition owns an append-only log; a stream processor replays it to
//! rebuild state and processes new commands.
//!
//! - [`logstream`]: sequencing, flow control and readers over [`storage`]
//! - [`snapshot`]: chunked transfer of snapshot directories
//! - [`distribution`]: replicating a command's effect to other partitions
//! - [`engine`]: the per-partition stream processor and its runtime
//! - [`cluster`]: an in-process cluster for tests and local runs

pub mod clock;
pub mod cluster;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod identity;
pub mod logstream;
pub mod record;
pub mod snapshot;
pub mod storage;
pub mod transport;
pub mod utils;
