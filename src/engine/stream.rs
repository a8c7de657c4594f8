//! Micro-Batch Streams
//!
//! The streaming side of the engine: records pushed by producers are cut into
//! discrete batches, one per interval tick.

use crate::error::EngineError;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// One interval's worth of records.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroBatch<T> {
    /// Starts at 0 and grows by one per emitted batch.
    pub sequence: u64,
    pub records: Vec<T>,
}

pub type MicroBatchStream<T> = BoxStream<'static, MicroBatch<T>>;

/// Producer side of a [`micro_batches`] stream. Cloneable; the stream ends
/// once every sender is dropped and the buffered records are emitted.
pub struct BatchSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for BatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> BatchSender<T> {
    pub fn send(&self, record: T) -> Result<(), EngineError> {
        self.tx.send(record).map_err(|_| EngineError::StreamClosed)
    }

    pub fn send_all(&self, records: impl IntoIterator<Item = T>) -> Result<(), EngineError> {
        records.into_iter().try_for_each(|record| self.send(record))
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct Batcher<T> {
    rx: mpsc::UnboundedReceiver<T>,
    ticker: Interval,
    buffer: Vec<T>,
    sequence: u64,
    closed: bool,
}

impl<T> Batcher<T> {
    fn emit(&mut self) -> MicroBatch<T> {
        let batch = MicroBatch {
            sequence: self.sequence,
            records: std::mem::take(&mut self.buffer),
        };
        self.sequence += 1;
        batch
    }
}

/// Creates a stream that emits whatever was sent during each `interval`.
/// Intervals with no records produce no batch.
pub fn micro_batches<T: Send + 'static>(interval: Duration) -> (BatchSender<T>, MicroBatchStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let batcher = Batcher {
        rx,
        ticker: ticker(interval),
        buffer: Vec::new(),
        sequence: 0,
        closed: false,
    };

    let stream = stream::unfold(batcher, |mut batcher| async move {
        loop {
            if batcher.closed {
                if batcher.buffer.is_empty() {
                    return None;
                }
                let batch = batcher.emit();
                return Some((batch, batcher));
            }

            tokio::select! {
                received = batcher.rx.recv() => match received {
                    Some(record) => batcher.buffer.push(record),
                    None => batcher.closed = true,
                },
                _ = batcher.ticker.tick() => {
                    if !batcher.buffer.is_empty() {
                        let batch = batcher.emit();
                        return Some((batch, batcher));
                    }
                }
            }
        }
    })
    .boxed();

    (BatchSender { tx }, stream)
}

/// Emits the given batches one per `interval` tick, then ends.
pub fn queue_stream<T: Send + 'static>(batches: Vec<Vec<T>>, interval: Duration) -> MicroBatchStream<T> {
    let state = (batches.into_iter().enumerate(), ticker(interval));

    stream::unfold(state, |(mut batches, mut ticker)| async move {
        let (sequence, records) = batches.next()?;
        ticker.tick().await;
        let batch = MicroBatch {
            sequence: sequence as u64,
            records,
        };
        Some((batch, (batches, ticker)))
    })
    .boxed()
}
