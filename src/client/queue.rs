use std::collections::VecDeque;

/// Bounded FIFO of serialized frames awaiting an open transport.
///
/// When full, the oldest entry is silently dropped to admit the newest.
pub struct OutboundQueue {
    buf: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Enqueue at the back, evicting the oldest entry when at capacity.
    pub fn push(&mut self, frame: String) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
            tracing::debug!(capacity = self.capacity, "Outbound queue full, dropped oldest frame");
        }
        self.buf.push_back(frame);
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.buf.drain(..).collect()
    }

    /// Put back frames that could not be flushed, ahead of anything queued
    /// since, preserving their original order.
    pub fn requeue_front(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.buf.push_front(frame);
        }
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
