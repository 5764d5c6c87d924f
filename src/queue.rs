//! Ordered, internally synchronized channel of output lines with a sticky
//! end-of-stream marker.
//!
//! The producer (output reader) never blocks; consumers may suspend with a
//! per-call timeout. Once the queue is closed, remaining lines still drain in
//! production order and every consumer then observes the end marker, as many
//! times as it asks.

use crate::error::SupervisorError;
use crate::state::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Non-blocking poll result for a single line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinePoll {
    /// A line was available.
    Line(String),
    /// Nothing queued yet; the stream has not ended. Poll again.
    Pending,
    /// The stream has ended and the queue is drained.
    EndOfStream,
}

pub(crate) struct OutputQueue {
    lines: Mutex<VecDeque<String>>,
    closed: AtomicBool,
    notify: Notify,
}

impl OutputQueue {
    pub(crate) fn new() -> Self {
        OutputQueue {
            lines: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Enqueue a line. Never blocks.
    pub(crate) fn push(&self, line: String) {
        lock(&self.lines).push_back(line);
        self.notify.notify_waiters();
    }

    /// Mark the stream as ended. Idempotent; queued lines remain consumable.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !lock(&self.lines).is_empty()
    }

    pub(crate) fn try_pop(&self) -> LinePoll {
        if let Some(line) = lock(&self.lines).pop_front() {
            return LinePoll::Line(line);
        }
        if self.is_closed() {
            LinePoll::EndOfStream
        } else {
            LinePoll::Pending
        }
    }

    /// Snapshot and remove everything currently queued. Non-blocking; the
    /// end marker is not consumed by draining.
    pub(crate) fn drain(&self) -> Vec<String> {
        lock(&self.lines).drain(..).collect()
    }

    /// Pop one line, suspending up to `timeout`. `Ok(None)` is the end
    /// marker; an elapsed timeout on an unfinished stream is an error.
    pub(crate) async fn pop(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, SupervisorError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register for a wakeup before checking, so a push between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            match self.try_pop() {
                LinePoll::Line(line) => return Ok(Some(line)),
                LinePoll::EndOfStream => return Ok(None),
                LinePoll::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut())
                        .await
                        .is_err()
                    {
                        // One last look at the boundary before giving up.
                        return match self.try_pop() {
                            LinePoll::Line(line) => Ok(Some(line)),
                            LinePoll::EndOfStream => Ok(None),
                            LinePoll::Pending => Err(SupervisorError::OperationTimeout {
                                waited: timeout.unwrap_or_default(),
                            }),
                        };
                    }
                }
                None => notified.as_mut().await,
            }
            notified.set(self.notify.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_delivery_order_equals_production_order() {
        let queue = OutputQueue::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.push("c".to_string());
        assert_eq!(queue.pop(None).await.unwrap(), Some("a".to_string()));
        assert_eq!(queue.pop(None).await.unwrap(), Some("b".to_string()));
        assert_eq!(queue.pop(None).await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_pop_timeout_on_unfinished_stream() {
        let queue = OutputQueue::new();
        let started = Instant::now();
        let result = queue.pop(Some(Duration::from_millis(80))).await;
        assert!(matches!(
            result,
            Err(SupervisorError::OperationTimeout { .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_zero_timeout_is_nonblocking() {
        let queue = OutputQueue::new();
        let result = queue.pop(Some(Duration::ZERO)).await;
        assert!(matches!(
            result,
            Err(SupervisorError::OperationTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_queued_lines_drain_before_end_marker() {
        let queue = OutputQueue::new();
        queue.push("last".to_string());
        queue.close();
        assert_eq!(queue.pop(None).await.unwrap(), Some("last".to_string()));
        assert_eq!(queue.pop(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_marker_is_sticky() {
        let queue = OutputQueue::new();
        queue.close();
        for _ in 0..3 {
            assert_eq!(queue.pop(Some(Duration::from_secs(5))).await.unwrap(), None);
            assert_eq!(queue.try_pop(), LinePoll::EndOfStream);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = OutputQueue::new();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_drain_preserves_end_marker() {
        let queue = OutputQueue::new();
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.close();
        assert_eq!(queue.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(queue.drain().is_empty());
        assert_eq!(queue.pop(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_pop_pending_on_open_empty_queue() {
        let queue = OutputQueue::new();
        assert_eq!(queue.try_pop(), LinePoll::Pending);
        queue.push("x".to_string());
        assert_eq!(queue.try_pop(), LinePoll::Line("x".to_string()));
        assert_eq!(queue.try_pop(), LinePoll::Pending);
    }

    #[tokio::test]
    async fn test_blocked_consumer_wakes_on_push() {
        let queue = Arc::new(OutputQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("wake".to_string());
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got, Some("wake".to_string()));
    }

    #[tokio::test]
    async fn test_blocked_consumer_wakes_on_close() {
        let queue = Arc::new(OutputQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_producer_consumer_ordering_under_concurrency() {
        let queue = Arc::new(OutputQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.push(format!("line-{i}"));
                    if i % 10 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
                queue.close();
            })
        };
        let mut seen = Vec::new();
        while let Some(line) = queue.pop(Some(Duration::from_secs(5))).await.unwrap() {
            seen.push(line);
        }
        producer.await.unwrap();
        let expected: Vec<String> = (0..100).map(|i| format!("line-{i}")).collect();
        assert_eq!(seen, expected);
    }
}
