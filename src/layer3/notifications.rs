// Notification Sink - ordered, dismissable queue of alert messages

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct NotificationSink {
    messages: Mutex<Vec<String>>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        self.messages.lock().push(message);
    }

    /// Remove the message at `index`; later messages shift down
    pub fn dismiss(&self, index: usize) -> Option<String> {
        let mut messages = self.messages.lock();
        if index < messages.len() {
            Some(messages.remove(index))
        } else {
            None
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
