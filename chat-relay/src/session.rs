use anyhow::Result;
use tracing::debug;

use crate::{message::Message, transport::Transport};

pub const WELCOME_TEXT: &str = "Welcome to the chat!";

/// One client's view of the chat: an owned transport plus the append-only
/// list of messages to display.
///
/// Sent messages are not appended locally. They show up once the transport
/// delivers them back, so the list always reflects arrival order.
pub struct ChatSession<T> {
    transport: T,
    messages: Vec<Message>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_welcome(transport, WELCOME_TEXT)
    }

    pub fn with_welcome(transport: T, welcome: impl Into<String>) -> Self {
        Self {
            transport,
            messages: vec![Message::system(welcome)],
        }
    }

    /// Sends `text` as entered. Blank input is ignored and reported as `false`.
    pub async fn send(&mut self, text: &str) -> Result<bool> {
        if text.trim().is_empty() {
            return Ok(false);
        }
        self.transport.send(&Message::user(text)).await?;
        Ok(true)
    }

    /// Waits for the next inbound message, appends it and returns a copy.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        let Some(message) = self.transport.recv().await? else {
            debug!("transport closed");
            return Ok(None);
        };
        self.messages.push(message.clone());
        Ok(Some(message))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Closes the transport and hands back everything that was displayed.
    pub async fn close(mut self) -> Result<Vec<Message>> {
        self.transport.close().await?;
        Ok(self.messages)
    }
}
