//! Global Sort Merge
//!
//! k-way merge over per-shard read-ahead buffers. Each buffer holds at most one
//! page; it is refilled only once drained, and all drained buffers are refilled
//! concurrently so one slow shard costs one round trip, not one per shard.

use super::pager::{RecordStream, ShardPager};
use super::types::{Record, ShardFailurePolicy, SortClause, compare_records};
use crate::error::ShardQueryError;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use std::collections::VecDeque;
use std::sync::Arc;

struct MergeSource {
    pager: ShardPager,
    buffer: VecDeque<Record>,
    done: bool,
}

impl MergeSource {
    fn needs_refill(&self) -> bool {
        !self.done && self.buffer.is_empty()
    }
}

pub struct SortedMerge {
    sources: Vec<MergeSource>,
    sort: Arc<Vec<SortClause>>,
    policy: ShardFailurePolicy,
    failures: VecDeque<ShardQueryError>,
    halted: bool,
}

impl SortedMerge {
    /// All pagers must share one query, so they share one effective sort.
    pub fn new(pagers: Vec<ShardPager>, policy: ShardFailurePolicy) -> Self {
        let sort = pagers
            .first()
            .map(|p| p.sort())
            .unwrap_or_else(|| Arc::new(Vec::new()));

        Self {
            sources: pagers
                .into_iter()
                .map(|pager| MergeSource {
                    pager,
                    buffer: VecDeque::new(),
                    done: false,
                })
                .collect(),
            sort,
            policy,
            failures: VecDeque::new(),
            halted: false,
        }
    }

    async fn refill(&mut self) {
        let pending = self
            .sources
            .iter_mut()
            .filter(|source| source.needs_refill())
            .map(|source| async move {
                match source.pager.next_page().await {
                    Ok(Some(page)) => {
                        source.buffer.extend(page);
                        None
                    }
                    Ok(None) => {
                        source.done = true;
                        None
                    }
                    Err(err) => {
                        source.done = true;
                        Some(err)
                    }
                }
            });

        let failures = join_all(pending).await;
        self.failures.extend(failures.into_iter().flatten());
    }

    /// Next record in global order, or a shard failure.
    ///
    /// A record is only released once every live shard has a buffered head,
    /// so a late shard can never hold a smaller key than one already yielded.
    pub async fn next(&mut self) -> Option<Result<Record, ShardQueryError>> {
        if self.halted {
            return None;
        }

        self.refill().await;

        if let Some(err) = self.failures.pop_front() {
            if self.policy == ShardFailurePolicy::FailFast {
                self.halted = true;
            }
            return Some(Err(err));
        }

        let sort = self.sort.clone();
        let winner = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(idx, source)| source.buffer.front().map(|head| (idx, head)))
            .min_by(|(_, a), (_, b)| compare_records(a, b, &sort))
            .map(|(idx, _)| idx)?;

        self.sources[winner].buffer.pop_front().map(Ok)
    }

    pub fn into_stream(self) -> RecordStream {
        stream::unfold(self, |mut merge| async move {
            let item = merge.next().await?;
            Some((item, merge))
        })
        .boxed()
    }
}
