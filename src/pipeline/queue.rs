//! Four bounded FIFO queues, one per priority level

use super::message::Message;
use crate::common::types::MessagePriority;
use crate::errors::PipelineError;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

pub struct PriorityQueues {
    queues: [Mutex<VecDeque<Message>>; 4],
    capacity: usize,
}

impl PriorityQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    fn queue(&self, priority: MessagePriority) -> MutexGuard<'_, VecDeque<Message>> {
        self.queues[priority.index()]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the queue for the message's priority. A full queue rejects.
    pub fn push(&self, message: Message) -> Result<(), PipelineError> {
        let priority = message.priority;
        let mut queue = self.queue(priority);
        if queue.len() >= self.capacity {
            return Err(PipelineError::QueueFull { priority });
        }
        queue.push_back(message);
        Ok(())
    }

    pub fn pop(&self, priority: MessagePriority) -> Option<Message> {
        self.queue(priority).pop_front()
    }

    /// Oldest message of the most urgent non-empty level
    pub fn pop_highest(&self) -> Option<Message> {
        MessagePriority::DESCENDING
            .iter()
            .find_map(|&p| self.pop(p))
    }

    pub fn len(&self, priority: MessagePriority) -> usize {
        self.queue(priority).len()
    }

    /// Depths indexed by `MessagePriority::index`
    pub fn depths(&self) -> [usize; 4] {
        [
            self.len(MessagePriority::Low),
            self.len(MessagePriority::Normal),
            self.len(MessagePriority::High),
            self.len(MessagePriority::Critical),
        ]
    }

    pub fn total(&self) -> usize {
        self.depths().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::MessageType;

    fn msg(topic: &str, priority: MessagePriority) -> Message {
        Message::new(topic, Vec::new(), MessageType::Notification, priority)
    }

    #[test]
    fn test_fifo_within_level() {
        let queues = PriorityQueues::new(10);
        queues.push(msg("first", MessagePriority::Normal)).unwrap();
        queues.push(msg("second", MessagePriority::Normal)).unwrap();

        assert_eq!(queues.pop_highest().unwrap().topic, "first");
        assert_eq!(queues.pop_highest().unwrap().topic, "second");
        assert!(queues.pop_highest().is_none());
    }

    #[test]
    fn test_full_level_rejects_without_affecting_others() {
        let queues = PriorityQueues::new(1);
        queues.push(msg("a", MessagePriority::Low)).unwrap();
        assert!(matches!(
            queues.push(msg("b", MessagePriority::Low)),
            Err(PipelineError::QueueFull {
                priority: MessagePriority::Low
            })
        ));
        queues.push(msg("c", MessagePriority::High)).unwrap();
        assert_eq!(queues.depths(), [1, 0, 1, 0]);
    }
}
