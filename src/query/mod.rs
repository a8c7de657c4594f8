//! Sharded Query Module
//!
//! Fans one logical query out to every shard and reassembles the answers.
//!
//! ## Core Mechanisms
//! - **Per-Shard Paging**: Each shard is walked by its own `ShardPager`, which owns
//!   the shard's `CursorState` and stops when the shard stops advancing its cursor.
//! - **Lazy Streams**: Nothing is requested until a stream is polled. Dropping a
//!   stream drops its in-flight request.
//! - **Ordering**: `PerShard` interleaves shard streams as they arrive; `GlobalSort`
//!   runs a k-way merge with at most one page of read-ahead per shard.
//! - **Failure Policy**: Shard errors are surfaced as `ShardQueryError`s in the stream.
//!   `FailFast` ends the result at the first one, `AllowPartial` keeps going.

pub mod executor;
pub mod merge;
pub mod pager;
pub mod types;
