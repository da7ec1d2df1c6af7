use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Info,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub kind: NoticeKind,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            kind: NoticeKind::Info,
        }
    }
}

/// Fire-and-forget sink for user-facing messages. Must never block.
pub trait NotificationSink {
    fn notify(&mut self, notice: Notice);
}

/// Sink used by the daemon: notices are held until the UI drains them.
#[derive(Debug, Default)]
pub struct NoticeQueue {
    pending: VecDeque<Notice>,
}

// Keeps memory bounded if the UI never drains.
const MAX_QUEUED_NOTICES: usize = 200;

impl NoticeQueue {
    pub fn drain(&mut self) -> Vec<Notice> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

impl NotificationSink for NoticeQueue {
    fn notify(&mut self, notice: Notice) {
        if self.pending.len() >= MAX_QUEUED_NOTICES {
            self.pending.pop_front();
        }
        self.pending.push_back(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_queue_in_order() {
        let mut q = NoticeQueue::default();
        q.notify(Notice::info("a", "first"));
        q.notify(Notice::info("b", "second"));
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].title, "a");
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn queue_drops_oldest_past_capacity() {
        let mut q = NoticeQueue::default();
        for i in 0..(MAX_QUEUED_NOTICES + 3) {
            q.notify(Notice::info(format!("n{}", i), ""));
        }
        let drained = q.drain();
        assert_eq!(drained.len(), MAX_QUEUED_NOTICES);
        assert_eq!(drained[0].title, "n3");
    }
}
