//! WebSocket client for the ASR streaming server.
//!
//! One persistent connection per session. The outbound half is serialized
//! behind a mutex so concurrent senders keep wire order; the inbound half
//! has a single reader. Reconnection retries with exponential backoff
//! until it succeeds or the session is cancelled.

pub mod messages;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::messages::InboundEvent;

/// Path of the ASR streaming endpoint.
pub const ASR_ENDPOINT: &str = "/api/asr-streaming";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "kyutai-api-key";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client for the ASR streaming WebSocket.
pub struct SttClient {
    server_url: String,
    api_key: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    closed: AtomicBool,
}

impl SttClient {
    /// Establish a connection, including the authentication header.
    pub async fn connect(server_url: &str, api_key: &str) -> Result<Self> {
        let (sink, stream) = open(server_url, api_key).await?;

        Ok(Self {
            server_url: server_url.to_string(),
            api_key: api_key.to_string(),
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send one PCM frame. Callers may race; the sink mutex keeps the wire
    /// order equal to the call order.
    pub async fn send_audio(&self, pcm: &[f32]) -> Result<()> {
        if self.is_closed() {
            bail!("connection is closed");
        }

        let data = messages::encode_audio(pcm)?;

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        sink.send(Message::Binary(data))
            .await
            .context("WebSocket send failed")
    }

    /// Block until the next server message arrives and decode it. Control
    /// frames are consumed transparently.
    pub async fn receive(&self) -> Result<InboundEvent> {
        let mut stream = self.stream.lock().await;
        let stream = stream.as_mut().ok_or_else(|| anyhow!("not connected"))?;

        loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| anyhow!("connection closed by server"))?
                .context("WebSocket receive failed")?;

            match msg {
                Message::Binary(data) => return messages::decode(&data),
                Message::Close(_) => bail!("server closed the connection"),
                Message::Text(payload) => {
                    debug!(payload = %payload, "ignoring unexpected text frame");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Drop any existing connection and redial with exponential backoff
    /// (1 s doubling to 60 s) until connected or `cancel` fires.
    /// `on_attempt(n, delay)` runs before each sleep.
    pub async fn reconnect(
        &self,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32, Duration),
    ) -> Result<()> {
        {
            let mut sink = self.sink.lock().await;
            let mut stream = self.stream.lock().await;
            *sink = None;
            *stream = None;
            self.closed.store(false, Ordering::SeqCst);
        }

        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            on_attempt(attempt, delay);

            tokio::select! {
                _ = cancel.cancelled() => bail!("reconnect cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }

            match open(&self.server_url, &self.api_key).await {
                Ok((sink, stream)) => {
                    *self.sink.lock().await = Some(sink);
                    *self.stream.lock().await = Some(stream);
                    self.closed.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, attempt = attempt, "reconnect attempt failed");
                    delay = next_backoff(delay);
                }
            }
        }
    }

    /// Send a normal closure and mark the client closed. Subsequent sends
    /// fail immediately.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *sink = None;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn open(
    server_url: &str,
    api_key: &str,
) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>)> {
    let url = build_url(server_url);

    let mut request = url
        .clone()
        .into_client_request()
        .with_context(|| format!("Invalid server URL: {url}"))?;
    request.headers_mut().insert(
        API_KEY_HEADER,
        HeaderValue::from_str(api_key).context("API key is not a valid header value")?,
    );

    let (ws, _) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    Ok(ws.split())
}

/// Append the ASR endpoint path unless the URL already carries it.
pub fn build_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if trimmed.ends_with(ASR_ENDPOINT) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{ASR_ENDPOINT}")
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
