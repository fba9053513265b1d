// src/core/cluster/delay_queue.rs

//! A time-bucketed retry scheduler.
//!
//! Retries of the same kind are coalesced into a named bucket. The first push
//! into an empty bucket arms a one-shot timer; later pushes append without
//! extending it. When the timer fires, the whole bucket drains at once, so a
//! storm of failures caused by one cluster event turns into a single
//! post-delay burst with at most one side effect.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct DelayBucket<T> {
    items: Vec<T>,
    /// Whether any push requested the bucket's side effect on flush.
    side_effect: bool,
    timer: JoinHandle<()>,
}

/// Named coalescing buckets of pending retries.
///
/// The receiver returned from [`DelayQueue::new`] yields the name of each
/// bucket whose timer fired; the owner then drains it with [`DelayQueue::take`].
pub struct DelayQueue<T> {
    buckets: HashMap<&'static str, DelayBucket<T>>,
    flush_tx: mpsc::UnboundedSender<&'static str>,
}

impl<T> DelayQueue<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<&'static str>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        (
            Self {
                buckets: HashMap::new(),
                flush_tx,
            },
            flush_rx,
        )
    }

    /// Adds an item to a bucket. The first push arms the bucket's timer for
    /// `timeout`; later pushes neither reset nor extend it. `side_effect`
    /// requests the bucket's at-most-once side effect on flush.
    pub fn push(&mut self, bucket: &'static str, item: T, timeout: Duration, side_effect: bool) {
        match self.buckets.get_mut(bucket) {
            Some(existing) => {
                existing.items.push(item);
                existing.side_effect |= side_effect;
            }
            None => {
                debug!(bucket, ?timeout, "arming retry bucket");
                let flush_tx = self.flush_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = flush_tx.send(bucket);
                });
                self.buckets.insert(
                    bucket,
                    DelayBucket {
                        items: vec![item],
                        side_effect,
                        timer,
                    },
                );
            }
        }
    }

    /// Drains a fired bucket: the items in insertion order, plus whether the
    /// side effect should run.
    pub fn take(&mut self, bucket: &'static str) -> Option<(Vec<T>, bool)> {
        self.buckets
            .remove(bucket)
            .map(|drained| (drained.items, drained.side_effect))
    }

    /// Aborts every timer and drains all buckets, in no particular order.
    pub fn clear(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        for (_, bucket) in self.buckets.drain() {
            bucket.timer.abort();
            items.extend(bucket.items);
        }
        items
    }

    pub fn len(&self, bucket: &'static str) -> usize {
        self.buckets.get(bucket).map_or(0, |b| b.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
