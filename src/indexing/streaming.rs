use super::pipeline::IndexingPipeline;
use super::types::StreamReport;
use crate::engine::stream::MicroBatchStream;
use crate::error::IndexingError;

use futures::StreamExt;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Submits every micro-batch of `batches` in order and flushes at the end.
///
/// Under an explicit commit policy with `every_secs`, a timer commits pending
/// batches once the window elapses, even when no further batch arrives.
/// Per-batch failures are folded into the report; only a closed pipeline stops the stream.
pub async fn index_stream<R: Send + Sync + 'static>(
    pipeline: &IndexingPipeline<R>,
    mut batches: MicroBatchStream<R>,
) -> Result<StreamReport, IndexingError> {
    let mut report = StreamReport::default();
    let mut commit_timer = commit_timer(pipeline);

    loop {
        let next = match commit_timer.as_mut() {
            Some(timer) => tokio::select! {
                batch = batches.next() => batch,
                _ = timer.tick() => {
                    if let Some(commit) = pipeline.commit_if_due().await {
                        report.absorb_commit(&commit);
                    }
                    continue;
                }
            },
            None => batches.next().await,
        };
        let Some(batch) = next else {
            break;
        };

        tracing::debug!(
            "Micro-batch {} with {} records",
            batch.sequence,
            batch.records.len()
        );
        let outcome = pipeline.submit(batch.records).await?;
        report.absorb(&outcome);
    }

    let commit = pipeline.flush().await;
    report.absorb_commit(&commit);

    tracing::info!(
        "Stream into '{}' finished: {} batches, {} indexed, {} failed, {} unmappable",
        pipeline.collection(),
        report.batches,
        report.indexed,
        report.failed,
        report.mapping_failures
    );
    Ok(report)
}

fn commit_timer<R: Send + Sync + 'static>(pipeline: &IndexingPipeline<R>) -> Option<Interval> {
    let period = pipeline.commit_policy().interval().filter(|p| !p.is_zero())?;
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}
