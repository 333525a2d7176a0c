use parking_lot::Mutex;
use std::collections::HashMap;

use crate::errors::SourceError;
use crate::source::Message;

/// Messages handed to the caller that have not been acked or failed yet,
/// keyed by delivery id.
#[derive(Debug, Default)]
pub struct UnackedTracker {
    messages: Mutex<HashMap<String, Message>>,
}

impl UnackedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserting the same id twice keeps a single entry.
    pub fn add(&self, message: Message) {
        self.messages.lock().insert(message.id().to_string(), message);
    }

    pub fn remove(&self, message: &Message) -> Result<(), SourceError> {
        self.messages
            .lock()
            .remove(message.id())
            .map(|_| ())
            .ok_or_else(|| SourceError::NotFound {
                id: message.id().to_string(),
            })
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Snapshot of the tracked messages in no particular order.
    pub fn list(&self) -> Vec<Message> {
        self.messages.lock().values().cloned().collect()
    }
}
