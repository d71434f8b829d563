//! Identity entities replicated to every partition.
//!
//! Groups are created and updated on one partition and distributed on the
//! `IDENTITY` queue, so every partition converges on the same groups in the
//! same order.

pub mod group;

pub use group::{GroupCreateProcessor, GroupRecord, GroupState, GroupUpdateProcessor};
