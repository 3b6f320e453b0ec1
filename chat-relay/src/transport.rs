//! Message channels a [`ChatSession`](crate::session::ChatSession) can run over.
//!
//! [`WsTransport`] talks to a running relay. [`MockTransport`] never leaves the
//! process: it echoes every sent message back after a short delay, which is
//! what the relay would do for a lone client.

use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, warn};

use crate::message::{Envelope, Message};

/// Bidirectional channel carrying [`Message`]s between a client and the relay.
pub trait Transport: Send {
    /// Emits `message` as a `message` event. A closed transport drops it silently.
    fn send(&mut self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    /// Waits for the next inbound message. `None` once the channel is closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Message>>> + Send;

    /// Releases the underlying resource. Closing twice is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Round-trip delay used by [`MockTransport::new`].
pub const DEFAULT_ECHO_DELAY: Duration = Duration::from_millis(100);

/// Local stand-in for a relay connection.
///
/// A single background task delivers echoes, so they arrive in send order.
/// Must be created inside a Tokio runtime.
pub struct MockTransport {
    outbound: Option<mpsc::UnboundedSender<(Instant, Message)>>,
    inbound: mpsc::UnboundedReceiver<Message>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_delay(DEFAULT_ECHO_DELAY)
    }

    pub fn with_delay(delay: Duration) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(Instant, Message)>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some((deliver_at, message)) = outbound_rx.recv().await {
                sleep_until(deliver_at).await;
                if inbound_tx.send(message).is_err() {
                    break;
                }
            }
        });

        Self {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            delay,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, message: &Message) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Ok(());
        };
        outbound
            .send((Instant::now() + self.delay, message.clone()))
            .context("mock echo task stopped")
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        if !self.is_connected() {
            return Ok(None);
        }
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }
}

/// WebSocket connection to a relay's `/ws` endpoint.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;

        info!("connected to {url}");
        Ok(Self {
            stream,
            closed: false,
        })
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, message: &Message) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let frame = Envelope::message(message)?.encode()?;
        self.stream
            .send(WsMessage::Text(frame.into()))
            .await
            .context("failed to send message")
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Ok(None);
        }

        while let Some(frame) = self.stream.next().await {
            let text = match frame.context("failed to read from relay")? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };

            let envelope = match Envelope::decode(text.as_str()) {
                Ok(envelope) => envelope,
                Err(error) => {
                    debug!(?error, "skipping undecodable frame");
                    continue;
                }
            };

            match envelope.into_message() {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(error) => warn!(?error, "skipping malformed message payload"),
            }
        }

        self.closed = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err).context("failed to close connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn mock_echoes_after_delay() {
        let mut transport = MockTransport::with_delay(Duration::from_millis(20));
        let message = Message::user("hello");
        let started = Instant::now();

        transport.send(&message).await.expect("send");
        let echoed = timeout(Duration::from_secs(1), transport.recv())
            .await
            .expect("echo arrives")
            .expect("recv")
            .expect("message");

        assert_eq!(echoed, message);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn mock_preserves_send_order() {
        let mut transport = MockTransport::with_delay(Duration::from_millis(5));
        for text in ["one", "two", "three"] {
            transport.send(&Message::user(text)).await.expect("send");
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            let message = timeout(Duration::from_secs(1), transport.recv())
                .await
                .expect("echo arrives")
                .expect("recv")
                .expect("message");
            received.push(message.text);
        }

        assert_eq!(received, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn closed_mock_drops_sends_and_stops_receiving() {
        let mut transport = MockTransport::with_delay(Duration::from_millis(5));
        transport.close().await.expect("close");
        assert!(!transport.is_connected());

        transport
            .send(&Message::user("ignored"))
            .await
            .expect("send after close is a no-op");
        assert_eq!(transport.recv().await.expect("recv"), None);

        transport.close().await.expect("second close is a no-op");
    }
}
