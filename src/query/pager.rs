use super::types::{CursorState, Query, Record, SortClause};
use crate::cluster::client::SearchClusterClient;
use crate::cluster::protocol::PageRequest;
use crate::error::ShardQueryError;
use crate::topology::types::{ShardEndpoint, ShardId};

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

/// Records of one or more shards, failures included in-band.
pub type RecordStream = BoxStream<'static, Result<Record, ShardQueryError>>;

/// Pagination loop for a single shard.
///
/// Restartable per shard: [`ShardPager::restart`] gives a fresh walk from the
/// first page. There is no global restart.
pub struct ShardPager {
    client: Arc<dyn SearchClusterClient>,
    collection: String,
    endpoint: ShardEndpoint,
    query: Arc<Query>,
    sort: Arc<Vec<SortClause>>,
    cursor: CursorState,
}

impl ShardPager {
    pub fn new(
        client: Arc<dyn SearchClusterClient>,
        collection: &str,
        endpoint: ShardEndpoint,
        query: Arc<Query>,
    ) -> Self {
        let sort = Arc::new(query.effective_sort());
        let cursor = CursorState::start(endpoint.shard_id.clone());
        Self {
            client,
            collection: collection.to_string(),
            endpoint,
            query,
            sort,
            cursor,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.endpoint.shard_id
    }

    pub fn endpoint(&self) -> &ShardEndpoint {
        &self.endpoint
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn sort(&self) -> Arc<Vec<SortClause>> {
        self.sort.clone()
    }

    /// A new pager for the same shard and query, positioned before the first page.
    pub fn restart(&self) -> Self {
        Self {
            client: self.client.clone(),
            collection: self.collection.clone(),
            endpoint: self.endpoint.clone(),
            query: self.query.clone(),
            sort: self.sort.clone(),
            cursor: CursorState::start(self.endpoint.shard_id.clone()),
        }
    }

    /// Fetches the next page. `Ok(None)` once the shard is exhausted.
    ///
    /// A failed request also exhausts the pager; the shard is not retried here.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>, ShardQueryError> {
        if self.cursor.exhausted {
            return Ok(None);
        }

        let request = PageRequest::for_shard(
            &self.collection,
            &self.endpoint,
            &self.query,
            &self.sort,
            &self.cursor.token,
        );

        match self.client.query_page(&self.endpoint, &request).await {
            Ok(page) => {
                let returned = page.docs.len();
                self.cursor.advance(returned, page.next_cursor);
                tracing::trace!(
                    "Shard {} returned {} records (emitted {}, exhausted: {})",
                    self.endpoint.shard_id,
                    returned,
                    self.cursor.emitted,
                    self.cursor.exhausted
                );

                if returned == 0 {
                    self.cursor.exhausted = true;
                    return Ok(None);
                }
                Ok(Some(page.docs))
            }
            Err(cause) => {
                self.cursor.exhausted = true;
                tracing::warn!(
                    "Query on shard {} ({}) failed: {}",
                    self.endpoint.shard_id,
                    self.endpoint.base_url,
                    cause
                );
                Err(ShardQueryError {
                    shard: self.endpoint.shard_id.clone(),
                    endpoint: self.endpoint.base_url.clone(),
                    emitted: self.cursor.emitted,
                    cause,
                })
            }
        }
    }

    /// Lazily yields every record of the shard in pagination order, then ends.
    /// A failure is yielded once as the last item.
    pub fn into_stream(self) -> RecordStream {
        stream::unfold(self, |mut pager| async move {
            match pager.next_page().await {
                Ok(Some(records)) => Some((Ok(records), pager)),
                Ok(None) => None,
                Err(err) => Some((Err(err), pager)),
            }
        })
        .flat_map(|page| match page {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).left_stream(),
            Err(err) => stream::iter(vec![Err(err)]).right_stream(),
        })
        .boxed()
    }
}

/// Ends `stream` right after its first error.
pub fn halt_after_error(stream: RecordStream) -> RecordStream {
    stream
        .scan(false, |halted, item| {
            if *halted {
                return futures::future::ready(None);
            }
            *halted = item.is_err();
            futures::future::ready(Some(item))
        })
        .boxed()
}
