use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;

/// One received message as shown to observers.
///
/// Entries are created by the inbound path only and never change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageLogEntry {
    /// Display line, `收到消息: <payload> (来自: <topic>)`
    pub text: String,
    pub payload: String,
    pub source_topic: String,
    /// Position in arrival order, starting at 0 for the first message
    pub received_order: u64,
    pub received_at: DateTime<Local>,
}

impl MessageLogEntry {
    pub fn from_topic(topic: String, payload: &[u8], received_order: u64) -> Self {
        let payload = String::from_utf8_lossy(payload).into_owned();
        MessageLogEntry {
            text: render(&topic, &payload),
            payload,
            source_topic: topic,
            received_order,
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for MessageLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.received_at.format("%H:%M:%S"),
            self.text
        )
    }
}

fn render(topic: &str, payload: &str) -> String {
    format!("收到消息: {payload} (来自: {topic})")
}

/// Received messages, newest first.
///
/// Unbounded unless a capacity is given, in which case the oldest entries fall
/// off the back.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    entries: VecDeque<MessageLogEntry>,
    capacity: Option<usize>,
}

impl MessageLog {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push_front(&mut self, entry: MessageLogEntry) {
        self.entries.push_front(entry);
        if let Some(cap) = self.capacity {
            self.entries.truncate(cap);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest(&self) -> Option<&MessageLogEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageLogEntry> {
        self.entries.iter()
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_text_names_payload_and_topic() {
        let entry = MessageLogEntry::from_topic("t/1".into(), b"hello", 0);
        assert_eq!(entry.text, "收到消息: hello (来自: t/1)");
        assert_eq!(entry.payload, "hello");
        assert_eq!(entry.source_topic, "t/1");
    }

    #[test]
    fn invalid_utf8_is_rendered_lossily() {
        let entry = MessageLogEntry::from_topic("t".into(), &[0x68, 0xff, 0x69], 0);
        assert_eq!(entry.payload, "h\u{fffd}i");
    }

    #[test]
    fn newest_entry_comes_first() {
        let mut log = MessageLog::default();
        for (i, payload) in ["a", "b", "c"].iter().enumerate() {
            log.push_front(MessageLogEntry::from_topic(
                "t".into(),
                payload.as_bytes(),
                i as u64,
            ));
        }

        assert_eq!(log.len(), 3);
        let orders: Vec<u64> = log.iter().map(|e| e.received_order).collect();
        assert_eq!(orders, vec![2, 1, 0]);
        assert_eq!(log.newest().map(|e| e.payload.as_str()), Some("c"));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut log = MessageLog::new(Some(2));
        for i in 0..5u64 {
            log.push_front(MessageLogEntry::from_topic("t".into(), b"x", i));
        }

        let orders: Vec<u64> = log.iter().map(|e| e.received_order).collect();
        assert_eq!(orders, vec![4, 3]);
    }
}
