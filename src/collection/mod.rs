//! Distributed Result Collection Module
//!
//! Exposes a sharded query as a partitioned collection of the local engine:
//! exactly one partition per shard, never split further.
//!
//! Building the partitions only reads topology. The shard itself is queried when a
//! worker computes the partition, and computing it again re-issues the query
//! from the first page. `count`, `collect`, `map_partitions` and `aggregate`
//! run one engine task per shard and report shards that failed next to the value.

pub mod partition;
pub mod sharded;
