//! Bounded in-memory message log.
//!
//! The relay keeps the most recent records in arrival order and hands a copy
//! to anyone who joins late. Once it holds more than its capacity, the oldest
//! record is dropped. Nothing survives a restart.

use std::collections::VecDeque;

use crate::{
    error::RelayError,
    record::{MessageRecord, Submission},
};

/// Number of records kept when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct MessageRelay {
    capacity: usize,
    records: VecDeque<MessageRecord>,
}

impl MessageRelay {
    pub fn new(capacity: usize) -> Result<Self, RelayError> {
        if capacity == 0 {
            return Err(RelayError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY) + 1),
        })
    }

    /// Stamps the submission, stores it and returns the stored record.
    ///
    /// Payload content and size are taken as-is.
    pub fn append(&mut self, submission: Submission) -> MessageRecord {
        let record = MessageRecord::stamp(submission);
        self.push(record.clone());
        record
    }

    /// Stores an already stamped record, returning whatever was evicted.
    pub fn push(&mut self, record: MessageRecord) -> Vec<MessageRecord> {
        self.records.push_back(record);
        let overflow = self.records.len().saturating_sub(self.capacity);
        self.records.drain(..overflow).collect()
    }

    /// Current records, oldest first.
    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageRelay {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            records: VecDeque::new(),
        }
    }
}
