use pilott_core::Message;

/// Message history sent to the LLM while a task executes.
///
/// The first message pinned with [`ContextWindow::pin`] (the task statement)
/// survives truncation; the rest is a sliding window of `max_messages`.
pub struct ContextWindow {
    messages: Vec<Message>,
    pinned: bool,
    system_prompt: Option<String>,
    max_messages: usize,
}

impl ContextWindow {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            pinned: false,
            system_prompt: None,
            max_messages: max_messages.max(1),
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Pin the message that must always lead the history.
    pub fn pin(&mut self, message: Message) {
        if self.pinned {
            self.messages[0] = message;
        } else {
            self.messages.insert(0, message);
            self.pinned = true;
        }
        self.truncate();
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.truncate();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn truncate(&mut self) {
        let keep_from = usize::from(self.pinned);
        let sliding = self.messages.len() - keep_from;
        if sliding > self.max_messages {
            let excess = sliding - self.max_messages;
            self.messages.drain(keep_from..keep_from + excess);
        }
    }
}
