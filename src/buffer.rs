//! Bounded backpressure buffer between a producer and a consumer.
//!
//! The producer side runs as a detached task feeding a bounded channel. In
//! `Buffer` mode the producer only pulls upstream when channel space is
//! reserved, so at most `capacity` items sit between the two sides. In
//! `Drop` mode upstream is drained eagerly and overflow items are discarded,
//! each discard counted in telemetry.

use crate::config::BufferStrategy;
use crate::telemetry::{emit, BufferEvent, PipelineEvent, SharedSink};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Wrap `input` with a bounded buffer of `capacity` items.
///
/// Dropping the returned stream closes the channel, which stops the producer
/// task and cancels the upstream stream.
pub(crate) fn bounded<T: Send + 'static>(
    input: BoxStream<'static, T>,
    capacity: usize,
    strategy: BufferStrategy,
    step: String,
    sink: SharedSink,
) -> BoxStream<'static, T> {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel::<T>(capacity);

    tokio::spawn(async move {
        let mut input = input;
        match strategy {
            BufferStrategy::Buffer => loop {
                // Reserve before pulling: upstream only advances on demand.
                let permit = match tx.reserve().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                match input.next().await {
                    Some(item) => {
                        permit.send(item);
                        let depth = capacity - tx.capacity();
                        emit(
                            &sink,
                            PipelineEvent::Buffer(BufferEvent::Depth {
                                step: step.clone(),
                                depth,
                                capacity,
                            }),
                        )
                        .await;
                    }
                    None => break,
                }
            },
            BufferStrategy::Drop => {
                while let Some(item) = input.next().await {
                    match tx.try_send(item) {
                        Ok(()) => {
                            let depth = capacity - tx.capacity();
                            emit(
                                &sink,
                                PipelineEvent::Buffer(BufferEvent::Depth {
                                    step: step.clone(),
                                    depth,
                                    capacity,
                                }),
                            )
                            .await;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            emit(
                                &sink,
                                PipelineEvent::Buffer(BufferEvent::Dropped {
                                    step: step.clone(),
                                }),
                            )
                            .await;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
    });

    ChannelStream { rx }.boxed()
}

struct ChannelStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{shared, MemorySink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counted_source(total: usize, pulled: Arc<AtomicUsize>) -> BoxStream<'static, usize> {
        futures::stream::iter(0..total)
            .map(move |n| {
                pulled.fetch_add(1, Ordering::SeqCst);
                n
            })
            .boxed()
    }

    #[tokio::test]
    async fn buffer_mode_limits_pulled_items() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut stream = bounded(
            counted_source(100, pulled.clone()),
            4,
            BufferStrategy::Buffer,
            "s".into(),
            shared(MemorySink::new()),
        );

        // No demand yet: the producer may fill the buffer but no more.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 4);

        // Draining two items frees exactly two slots.
        assert_eq!(stream.next().await, Some(0));
        assert_eq!(stream.next().await, Some(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn buffer_mode_delivers_everything_in_order() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let stream = bounded(
            counted_source(20, pulled),
            3,
            BufferStrategy::Buffer,
            "s".into(),
            shared(MemorySink::new()),
        );
        let collected: Vec<usize> = stream.collect().await;
        assert_eq!(collected, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drop_mode_discards_overflow_and_counts_it() {
        let sink = MemorySink::new();
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut stream = bounded(
            counted_source(50, pulled),
            2,
            BufferStrategy::Drop,
            "s".into(),
            shared(sink.clone()),
        );

        // Let the producer race ahead with no consumer demand.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut delivered = Vec::new();
        while let Some(n) = stream.next().await {
            delivered.push(n);
        }

        let dropped = sink
            .events()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::Buffer(BufferEvent::Dropped { .. })))
            .count();
        assert_eq!(delivered.len() + dropped, 50);
        assert!(dropped >= 50 - 2 - delivered.len());
        // Survivors keep their relative order.
        let mut sorted = delivered.clone();
        sorted.sort_unstable();
        assert_eq!(delivered, sorted);
    }

    #[tokio::test]
    async fn dropping_consumer_stops_producer() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let stream = bounded(
            counted_source(1000, pulled.clone()),
            2,
            BufferStrategy::Buffer,
            "s".into(),
            shared(MemorySink::new()),
        );
        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = pulled.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), after);
        assert!(after <= 3);
    }

    #[tokio::test]
    async fn depth_events_carry_capacity() {
        let sink = MemorySink::new();
        let stream = bounded(
            futures::stream::iter(0..3).boxed(),
            8,
            BufferStrategy::Buffer,
            "fanout".into(),
            shared(sink.clone()),
        );
        let _: Vec<i32> = stream.collect().await;

        let depths: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Buffer(BufferEvent::Depth { step, depth, capacity }) => {
                    Some((step, depth, capacity))
                }
                _ => None,
            })
            .collect();
        assert!(!depths.is_empty());
        for (step, depth, capacity) in depths {
            assert_eq!(step, "fanout");
            assert_eq!(capacity, 8);
            assert!(depth <= capacity);
        }
    }
}
