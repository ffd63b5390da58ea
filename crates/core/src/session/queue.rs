use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CastError, Result};
use crate::session::message::{Message, MessageId};

struct Delayed {
    deadline: Instant,
    message: Message,
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<Message>,
    delayed: Vec<Delayed>,
    closed: bool,
}

impl QueueInner {
    /// Move delayed messages whose deadline has passed to the back of the
    /// queue, earliest first.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|d| d.deadline);
        let due = self.delayed.partition_point(|d| d.deadline <= now);
        for delayed in self.delayed.drain(..due) {
            self.messages.push_back(delayed.message);
        }
    }
}

/// FIFO message queue feeding one session worker.
///
/// Supports delayed messages, removal by id and pushing deferred messages
/// back to the front.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: Message) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CastError::SessionClosed);
        }
        inner.messages.push_back(message);
        self.ready.notify_one();
        Ok(())
    }

    pub fn post_delayed(&self, message: Message, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CastError::SessionClosed);
        }
        inner.delayed.push(Delayed {
            deadline: Instant::now() + delay,
            message,
        });
        self.ready.notify_one();
        Ok(())
    }

    /// Put `messages` ahead of everything queued, keeping their order.
    pub fn post_front(&self, messages: Vec<Message>) {
        let mut inner = self.inner.lock();
        for message in messages.into_iter().rev() {
            inner.messages.push_front(message);
        }
        self.ready.notify_one();
    }

    /// Drop every queued or delayed message with `id`.
    pub fn remove(&self, id: MessageId) {
        let mut inner = self.inner.lock();
        inner.messages.retain(|m| m.id != id);
        inner.delayed.retain(|d| d.message.id != id);
    }

    pub fn has_delayed(&self, id: MessageId) -> bool {
        self.inner.lock().delayed.iter().any(|d| d.message.id == id)
    }

    /// Block until a message is due. `None` once the queue is closed.
    pub fn next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            inner.promote_due(Instant::now());
            if let Some(message) = inner.messages.pop_front() {
                return Some(message);
            }
            match inner.delayed.iter().map(|d| d.deadline).min() {
                Some(deadline) => {
                    self.ready.wait_until(&mut inner, deadline);
                }
                None => self.ready.wait(&mut inner),
            }
        }
    }

    /// Next message if one is due now.
    pub fn try_next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.promote_due(Instant::now());
        inner.messages.pop_front()
    }

    /// Stop the queue. Pending messages are dropped and later posts fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.messages.clear();
        inner.delayed.clear();
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn msg(id: MessageId) -> Message {
        Message::new(id)
    }

    #[test]
    fn deferred_messages_jump_the_queue_in_order() {
        let queue = MessageQueue::new();
        queue.post(msg(MessageId::Pause)).unwrap();
        queue.post_front(vec![msg(MessageId::Connect), msg(MessageId::Play)]);

        let order: Vec<_> = std::iter::from_fn(|| queue.try_next())
            .map(|m| m.id)
            .collect();
        assert_eq!(
            order,
            vec![MessageId::Connect, MessageId::Play, MessageId::Pause]
        );
    }

    #[test]
    fn removed_timeout_never_fires() {
        let queue = MessageQueue::new();
        queue
            .post_delayed(msg(MessageId::ConnectTimeout), Duration::from_millis(10))
            .unwrap();
        assert!(queue.has_delayed(MessageId::ConnectTimeout));
        queue.remove(MessageId::ConnectTimeout);
        thread::sleep(Duration::from_millis(20));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn delayed_message_wakes_blocked_reader() {
        let queue = Arc::new(MessageQueue::new());
        queue
            .post_delayed(msg(MessageId::ConnectTimeout), Duration::from_millis(20))
            .unwrap();
        let started = Instant::now();
        assert_eq!(queue.next().map(|m| m.id), Some(MessageId::ConnectTimeout));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_wakes_reader_and_rejects_posts() {
        let queue = Arc::new(MessageQueue::new());
        let reader = {
            let queue = queue.clone();
            thread::spawn(move || queue.next())
        };
        thread::sleep(Duration::from_millis(10));
        queue.close();
        assert!(reader.join().unwrap().is_none());
        assert!(matches!(
            queue.post(msg(MessageId::Play)),
            Err(CastError::SessionClosed)
        ));
    }
}
