//! Component 4 (message queue fabric): the per-task FIFO that the log
//! hook, the agent-stream pump, and the outbound-stream drainer all
//! share. Multiple producers, one consumer.

use std::time::Duration;

use isolate_api_grpc::proto::isolate::v1::PartialRunResult;
use tokio::sync::mpsc;

/// Default bound on the number of buffered `PartialRunResult`s per
/// task. Producers block (rather than drop messages) once the queue is
/// full, which is the backpressure the spec allows in place of an
/// unbounded queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MessageQueue {
    tx: mpsc::Sender<PartialRunResult>,
}

impl MessageQueue {
    /// Used by producers that can tolerate blocking: the pump and the
    /// builder-phase log hook both run on their own task.
    pub async fn put(&self, message: PartialRunResult) {
        // The only way `send` fails is if the drainer has already been
        // dropped, which only happens once the stream itself has ended
        // (client disconnect or cancellation) - nothing useful to do
        // with that message at that point.
        let _ = self.tx.send(message).await;
    }

    /// Best-effort enqueue for producers that must never block, namely
    /// synchronous log hooks invoked from builder code.
    pub fn put_nowait(&self, message: PartialRunResult) {
        let _ = self.tx.try_send(message);
    }
}

pub struct MessageDrainer {
    rx: mpsc::Receiver<PartialRunResult>,
}

pub fn channel(capacity: usize) -> (MessageQueue, MessageDrainer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MessageQueue { tx }, MessageDrainer { rx })
}

pub enum Drained {
    Message(PartialRunResult),
    /// No message arrived within `keep_alive_after`; the caller should
    /// emit a synthetic empty `PartialRunResult` and keep watching.
    KeepAlive,
    /// Every [`MessageQueue`] clone for this task has been dropped, i.e.
    /// the pipeline has finished producing (successfully or not) and
    /// there is nothing left to wait for. Distinct from `KeepAlive` so
    /// the drainer stops polling instead of busy-looping synthetic
    /// elements once the channel is permanently empty - this matters
    /// most on a failure that never enqueues an `is_complete` element.
    Closed,
}

impl MessageDrainer {
    /// Waits for the next message, emitting [`Drained::KeepAlive`] if
    /// none arrives within `keep_alive_after`, or [`Drained::Closed`]
    /// once every producer has dropped its queue handle. Used while a
    /// producer (builder or pump) is still running.
    pub async fn recv_with_keepalive(&mut self, keep_alive_after: Duration) -> Drained {
        match tokio::time::timeout(keep_alive_after, self.rx.recv()).await {
            Ok(Some(message)) => Drained::Message(message),
            Ok(None) => Drained::Closed,
            Err(_) => Drained::KeepAlive,
        }
    }

    /// Drains whatever is already buffered without waiting. Called
    /// once the producer has finished, to flush any messages it
    /// enqueued right before completing.
    pub fn drain_remaining(&mut self) -> Vec<PartialRunResult> {
        let mut drained = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            drained.push(message);
        }
        drained
    }

    /// Discards every message as it arrives until every [`MessageQueue`]
    /// handle for this task has dropped. Meant to run concurrently with
    /// the producer (not after it finishes, like [`Self::drain_remaining`]):
    /// a `Submit`ted task has no reader for its queue at all, and the
    /// bounded channel backs up `queue.put(...).await` in the pump
    /// (and the log hook) once it fills unless something keeps consuming
    /// it the whole time the pipeline runs.
    pub async fn drain_until_closed(&mut self) {
        while self.rx.recv().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_api_grpc::proto::isolate::v1::PartialRunResult;

    fn msg(n: i32) -> PartialRunResult {
        PartialRunResult {
            is_complete: false,
            logs: vec![],
            result: None,
        }
        .tap_index(n)
    }

    trait TapIndex {
        fn tap_index(self, n: i32) -> Self;
    }

    impl TapIndex for PartialRunResult {
        fn tap_index(mut self, n: i32) -> Self {
            self.logs.push(isolate_api_grpc::proto::isolate::v1::Log {
                message: n.to_string(),
                level: 0,
                source: 0,
            });
            self
        }
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let (queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        for i in 0..5 {
            queue.put(msg(i)).await;
        }
        drop(queue);

        let mut seen = Vec::new();
        loop {
            match drainer.recv_with_keepalive(Duration::from_millis(50)).await {
                Drained::Message(m) => seen.push(m.logs[0].message.clone()),
                Drained::Closed => break,
                Drained::KeepAlive => panic!("queue was dropped, should observe Closed not KeepAlive"),
            }
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn closed_is_reported_once_every_sender_is_dropped() {
        let (queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        drop(queue);
        let drained = drainer.recv_with_keepalive(Duration::from_secs(5)).await;
        assert!(matches!(drained, Drained::Closed));
    }

    #[tokio::test]
    async fn keepalive_fires_when_idle() {
        let (_queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        let drained = drainer.recv_with_keepalive(Duration::from_millis(10)).await;
        assert!(matches!(drained, Drained::KeepAlive));
    }

    #[tokio::test]
    async fn drain_remaining_is_nonblocking_and_empties_the_buffer() {
        let (queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        queue.put_nowait(msg(1));
        queue.put_nowait(msg(2));
        let drained = drainer.drain_remaining();
        assert_eq!(drained.len(), 2);
        assert!(drainer.drain_remaining().is_empty());
    }

    #[tokio::test]
    async fn drain_until_closed_keeps_up_with_a_producer_past_the_channel_capacity() {
        let (queue, mut drainer) = channel(4);
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                // With a capacity-4 channel and nothing reading, the 5th
                // `put` would block forever without a concurrent drainer.
                queue.put(msg(i)).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(5), drainer.drain_until_closed())
            .await
            .expect("drain_until_closed did not keep pace with the producer");

        producer.await.unwrap();
    }
}
