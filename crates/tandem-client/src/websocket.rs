//! WebSocket signaling client.
//!
//! The connection is split into a writer task draining an outbound queue, a
//! reader task decoding inbound text messages, and a heartbeat task sending
//! `{"type":"ping"}` on a fixed interval.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tandem_protocol::{codec, ClientIdentity, Frame, Inbound, SignalType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, trace, warn};

use crate::error::ClientError;

/// Interval between heartbeats unless configured otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between heartbeats. `None` sends none.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

/// A text message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// The message exactly as received.
    pub text: String,
    /// The decoded message.
    pub inbound: Inbound,
}

impl Received {
    /// Get the known frame, if this is one.
    #[must_use]
    pub fn frame(&self) -> Option<&Frame> {
        match &self.inbound {
            Inbound::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

fn request_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}authToken={}", urlencoding::encode(token))
}

/// Connection to one relay endpoint.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Received>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connect to `url`, authenticating with `token`.
    ///
    /// The token is percent-encoded into the `authToken` query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the server answers the upgrade
    /// with an HTTP error, or a WebSocket error if the handshake fails.
    pub async fn connect(url: &str, token: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(request_url(url, token)).await.map_err(|e| match e {
            WsError::Http(response) => ClientError::Rejected(response.status().as_u16()),
            other => ClientError::WebSocket(other),
        })?;
        debug!(url, "Connected to relay");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Send failed, stopping writer");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => match codec::decode(&text) {
                        Ok(inbound) => {
                            if inbound_tx.send(Received { text, inbound }).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Discarding malformed message from relay"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Relay closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Connection error");
                        break;
                    }
                }
            }
        });

        let heartbeat = match config.heartbeat_interval {
            Some(interval) => Some(spawn_heartbeat(outbound.clone(), interval)?),
            None => None,
        };

        Ok(Self {
            outbound,
            inbound,
            writer,
            reader,
            heartbeat,
        })
    }

    fn send_text(&self, text: String) -> Result<(), ClientError> {
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send a protocol frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is closed.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        self.send_text(codec::encode(frame)?)
    }

    /// Send a signaling envelope to `to` on a direct-call connection.
    ///
    /// `from` must be the identity the token resolves to, or the relay drops
    /// the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is closed.
    pub fn send_signal(
        &self,
        to: ClientIdentity,
        from: ClientIdentity,
        signal_type: SignalType,
        signal_data: Value,
    ) -> Result<(), ClientError> {
        self.send_frame(&Frame::signal(to, from, signal_type, signal_data))
    }

    /// Send an arbitrary JSON message, for random-call partners.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the connection is closed.
    pub fn send_json(&self, message: &Value) -> Result<(), ClientError> {
        self.send_text(serde_json::to_string(message)?)
    }

    /// Receive the next message. Returns `None` once the connection ends.
    pub async fn next(&mut self) -> Option<Received> {
        self.inbound.recv().await
    }

    /// Receive the next message, waiting at most `timeout`.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<Received> {
        tokio::time::timeout(timeout, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Close the connection and wait for the writer to finish.
    pub async fn close(mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        let _ = self.outbound.send(Message::Close(None));
        if let Err(e) = (&mut self.writer).await {
            trace!(error = %e, "Writer task ended abnormally");
        }
    }
}

fn spawn_heartbeat(
    outbound: mpsc::UnboundedSender<Message>,
    interval: Duration,
) -> Result<JoinHandle<()>, ClientError> {
    let ping = codec::encode(&Frame::ping())?;

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            trace!("Sending heartbeat");
            if outbound.send(Message::Text(ping.clone())).is_err() {
                break;
            }
        }
    }))
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        self.reader.abort();
    }
}
