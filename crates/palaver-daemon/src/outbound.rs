//! Per-session outbound queue.
//!
//! A bounded FIFO of plaintext chat frames plus an unbounded lane for
//! control records. Control records (auth responses, rekey messages, close
//! notices) are never dropped and always dequeue ahead of chat. Chat
//! overflow policy depends on the producer:
//!
//! - **Broadcast** uses [`OutboundQueue::push_chat`]: at capacity the
//!   oldest queued chat frame is dropped to admit the new one, and the
//!   caller counts the drop.
//! - **Unicast** uses [`OutboundQueue::try_push_chat`]: at capacity the
//!   enqueue is refused so the sender can be told the peer is
//!   backpressured.
//!
//! The single consumer is the owning connection's write pump. Nothing here
//! blocks a producer: pushes are lock-then-release with no suspension
//! point.

use std::collections::VecDeque;
use std::sync::Mutex;

use palaver_core::chat::ChatFrame;
use palaver_core::record::Record;
use tokio::sync::Notify;

/// Something waiting to be written to the peer.
#[derive(Debug)]
pub enum OutboundItem {
    /// Plaintext chat frame; the write pump seals it.
    Chat(ChatFrame),
    /// Pre-encoded control record; written as-is.
    Control(Record),
}

/// Outcome of a best-effort chat enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEnqueue {
    /// Frame queued within capacity.
    Enqueued,
    /// Frame queued; the oldest queued chat frame was dropped to make
    /// room.
    DroppedOldest,
    /// Queue is closed; frame discarded.
    Closed,
}

/// Why a strict chat enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryEnqueueError {
    /// Queue is at capacity.
    Full,
    /// Queue is closed.
    Closed,
}

#[derive(Debug, Default)]
struct Lanes {
    control: VecDeque<Record>,
    chat: VecDeque<ChatFrame>,
    closed: bool,
}

/// Bounded two-lane outbound queue. See the module docs for the overflow
/// policy.
#[derive(Debug)]
pub struct OutboundQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Creates a queue admitting at most `capacity` chat frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lanes> {
        self.lanes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Best-effort enqueue used by broadcast.
    pub fn push_chat(&self, frame: ChatFrame) -> ChatEnqueue {
        let outcome = {
            let mut lanes = self.lock();
            if lanes.closed {
                return ChatEnqueue::Closed;
            }
            let dropped = if lanes.chat.len() >= self.capacity {
                lanes.chat.pop_front();
                true
            } else {
                false
            };
            lanes.chat.push_back(frame);
            if dropped {
                ChatEnqueue::DroppedOldest
            } else {
                ChatEnqueue::Enqueued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Strict enqueue used by unicast: refuses rather than drops.
    ///
    /// # Errors
    ///
    /// [`TryEnqueueError::Full`] at capacity, [`TryEnqueueError::Closed`]
    /// after close.
    pub fn try_push_chat(&self, frame: ChatFrame) -> Result<(), TryEnqueueError> {
        {
            let mut lanes = self.lock();
            if lanes.closed {
                return Err(TryEnqueueError::Closed);
            }
            if lanes.chat.len() >= self.capacity {
                return Err(TryEnqueueError::Full);
            }
            lanes.chat.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueues a control record. Control is never dropped and preempts
    /// chat on dequeue. Returns `false` if the queue is closed.
    pub fn push_control(&self, record: Record) -> bool {
        {
            let mut lanes = self.lock();
            if lanes.closed {
                return false;
            }
            lanes.control.push_back(record);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeues the next item without waiting.
    pub fn try_pop(&self) -> Option<OutboundItem> {
        let mut lanes = self.lock();
        if let Some(record) = lanes.control.pop_front() {
            return Some(OutboundItem::Control(record));
        }
        lanes.chat.pop_front().map(OutboundItem::Chat)
    }

    /// Waits for the next item. Returns `None` once the queue is closed
    /// and empty.
    pub async fn pop(&self) -> Option<OutboundItem> {
        loop {
            {
                let mut lanes = self.lock();
                if let Some(record) = lanes.control.pop_front() {
                    return Some(OutboundItem::Control(record));
                }
                if let Some(frame) = lanes.chat.pop_front() {
                    return Some(OutboundItem::Chat(frame));
                }
                if lanes.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Closes the queue. Queued items remain poppable; new pushes are
    /// refused.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    /// Number of queued chat frames.
    #[must_use]
    pub fn chat_len(&self) -> usize {
        self.lock().chat.len()
    }

    /// True when both lanes are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let lanes = self.lock();
        lanes.control.is_empty() && lanes.chat.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use palaver_core::chat::ChatKind;
    use palaver_core::error::CloseReason;

    use super::*;

    fn chat(body: &[u8]) -> ChatFrame {
        ChatFrame::new(ChatKind::Text, 0, body.to_vec()).unwrap()
    }

    #[test]
    fn control_preempts_chat() {
        let queue = OutboundQueue::new(8);
        assert_eq!(queue.push_chat(chat(b"early")), ChatEnqueue::Enqueued);
        assert!(queue.push_control(Record::Keepalive));

        assert!(matches!(
            queue.try_pop(),
            Some(OutboundItem::Control(Record::Keepalive))
        ));
        assert!(matches!(queue.try_pop(), Some(OutboundItem::Chat(_))));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn broadcast_overflow_drops_the_oldest_chat() {
        let queue = OutboundQueue::new(2);
        assert_eq!(queue.push_chat(chat(b"a")), ChatEnqueue::Enqueued);
        assert_eq!(queue.push_chat(chat(b"b")), ChatEnqueue::Enqueued);
        assert_eq!(queue.push_chat(chat(b"c")), ChatEnqueue::DroppedOldest);
        assert_eq!(queue.chat_len(), 2);

        let Some(OutboundItem::Chat(first)) = queue.try_pop() else {
            panic!("expected chat");
        };
        assert_eq!(first.body, b"b");
    }

    #[test]
    fn unicast_overflow_is_refused_not_dropped() {
        let queue = OutboundQueue::new(1);
        queue.try_push_chat(chat(b"only")).unwrap();
        assert_eq!(
            queue.try_push_chat(chat(b"extra")),
            Err(TryEnqueueError::Full)
        );
        // The queued frame is untouched.
        assert_eq!(queue.chat_len(), 1);
    }

    #[test]
    fn control_is_unaffected_by_chat_capacity() {
        let queue = OutboundQueue::new(1);
        queue.try_push_chat(chat(b"fill")).unwrap();
        assert!(queue.push_control(Record::Close(CloseReason::Server)));
        assert!(matches!(
            queue.try_pop(),
            Some(OutboundItem::Control(Record::Close(CloseReason::Server)))
        ));
    }

    #[test]
    fn closed_queue_refuses_pushes_but_drains() {
        let queue = OutboundQueue::new(4);
        queue.push_chat(chat(b"queued"));
        queue.close();

        assert_eq!(queue.push_chat(chat(b"late")), ChatEnqueue::Closed);
        assert_eq!(
            queue.try_push_chat(chat(b"late")),
            Err(TryEnqueueError::Closed)
        );
        assert!(!queue.push_control(Record::Keepalive));

        assert!(matches!(queue.try_pop(), Some(OutboundItem::Chat(_))));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_chat(chat(b"wake"));

        let item = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop should wake")
            .unwrap();
        assert!(matches!(item, Some(OutboundItem::Chat(_))));
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_drains() {
        let queue = Arc::new(OutboundQueue::new(4));
        queue.push_chat(chat(b"last"));
        queue.close();

        assert!(matches!(queue.pop().await, Some(OutboundItem::Chat(_))));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_a_parked_popper() {
        let queue = Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let item = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("close should wake")
            .unwrap();
        assert!(item.is_none());
    }
}
