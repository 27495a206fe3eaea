use crate::protocol::{Level, MESSAGE_PREFIX_SIZE};

/// Largest text that still fits the 32-bit body length of a MESSAGE packet.
pub const MAX_TEXT_LEN: usize = u32::MAX as usize - MESSAGE_PREFIX_SIZE;

/// A single log record.
///
/// Messages are immutable. The [`Core`](crate::core::Core) stamps the
/// timestamp and index when it accepts a message, then shares the same
/// `Arc<Message>` with every attached sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    timestamp: i64,
    index: u32,
    category: u32,
    level: Level,
    text: String,
}

impl Message {
    /// Creates a message.
    ///
    /// # Arguments
    ///
    /// * `timestamp` - Microseconds since the Unix epoch
    /// * `index` - Sequence number within the producing core
    /// * `category` - Category id, 0 for none
    /// * `level` - Severity
    /// * `text` - Message text; truncated on a char boundary if it would not
    ///   fit a single packet
    pub fn new(timestamp: i64, index: u32, category: u32, level: Level, mut text: String) -> Self {
        if text.len() > MAX_TEXT_LEN {
            let mut end = MAX_TEXT_LEN;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Self {
            timestamp,
            index,
            category,
            level,
            text,
        }
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn category(&self) -> u32 {
        self.category
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }
}
