//! The Connection (§4.2): one outbound WebSocket to the browser, discovered
//! via an HTTP bootstrap, with two send primitives and per-session event
//! subscriptions.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::{Codec, Frame};
use crate::error::CdpError;
use crate::types::{CallId, SessionId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct DiscoveryPayload {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// A decoded event, already classified as belonging to a session or not.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub method: Cow<'static, str>,
    pub params: Value,
    pub session_id: Option<SessionId>,
}

/// Owns the single WebSocket to the browser. All state is behind a
/// [`Mutex`] because `send_async`/`send`/`subscribe` are called concurrently
/// by the Manager's control-plane code paths, but there is never contention
/// in steady state: the Manager is the only caller.
pub struct Connection {
    codec: Mutex<Codec>,
    ws: Mutex<WsStream>,
    closed: AtomicBool,
    subscriptions: Mutex<HashMap<SessionId, mpsc::Sender<ConnectionEvent>>>,
    browser_events: Mutex<Vec<ConnectionEvent>>,
    buffered_responses: Mutex<HashMap<CallId, Result<Value, CdpError>>>,
}

impl Connection {
    /// Bootstraps against `http://<address>/json/version` and opens the
    /// WebSocket it advertises.
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self, CdpError> {
        let discovery_url = format!("http://{address}/json/version");
        let client = reqwest::Client::new();
        let payload: DiscoveryPayload = tokio::time::timeout(connect_timeout, async {
            let resp = client
                .get(&discovery_url)
                .send()
                .await
                .map_err(|e| CdpError::ConnectionFailed(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(CdpError::ConnectionFailed(format!(
                    "discovery endpoint returned {}",
                    resp.status()
                )));
            }
            resp.json::<DiscoveryPayload>()
                .await
                .map_err(|e| CdpError::ConnectionFailed(format!("unparseable discovery payload: {e}")))
        })
        .await
        .map_err(|_| CdpError::ConnectionFailed("discovery request timed out".into()))??;

        let ws_url = url::Url::parse(&payload.web_socket_debugger_url)
            .map_err(|e| CdpError::ConnectionFailed(format!("malformed webSocketDebuggerUrl: {e}")))?;

        let (ws, _) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(ws_url))
            .await
            .map_err(|_| CdpError::ConnectionFailed("websocket handshake timed out".into()))?
            .map_err(|e| CdpError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            codec: Mutex::new(Codec::new()),
            ws: Mutex::new(ws),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            browser_events: Mutex::new(Vec::new()),
            buffered_responses: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Encodes and writes a command without waiting for its reply (§4.2).
    pub async fn send_async(
        &self,
        method: impl Into<Cow<'static, str>>,
        params: Value,
        session: Option<&SessionId>,
    ) -> Result<CallId, CdpError> {
        if self.is_closed() {
            return Err(CdpError::Disconnected);
        }
        let (id, text) = self.codec.lock().await.encode(method, params, session);
        let mut ws = self.ws.lock().await;
        if let Err(e) = ws.send(WsMessage::Text(text.into())).await {
            self.mark_closed();
            return Err(CdpError::ConnectionFailed(e.to_string()));
        }
        Ok(id)
    }

    /// Writes a command and blocks until its response (or a timeout, or
    /// connection closure) arrives, draining and routing any other frames
    /// seen along the way (§4.2).
    pub async fn send(
        &self,
        method: impl Into<Cow<'static, str>>,
        params: Value,
        session: Option<&SessionId>,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let id = self.send_async(method, params, session).await?;
        self.await_response(id, timeout).await
    }

    /// Drains frames off the wire until `id`'s response shows up, routing
    /// events to subscriptions and buffering unrelated responses for later
    /// pickup via [`Connection::drain_responses`].
    async fn await_response(&self, id: CallId, timeout: Duration) -> Result<Value, CdpError> {
        if let Some(result) = self.buffered_responses.lock().await.remove(&id) {
            return result;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CdpError::Timeout(format!("call {id} timed out")));
            }
            match tokio::time::timeout(remaining, self.read_one_frame()).await {
                Ok(Ok(Some(Frame::Response { id: got, result }))) => {
                    if got == id {
                        return Ok(result);
                    }
                    self.buffered_responses.lock().await.insert(got, Ok(result));
                }
                Ok(Ok(Some(Frame::ErrorResponse { id: got, error }))) => {
                    let err = CdpError::from_remote(error.message, None);
                    if got == id {
                        return Err(err);
                    }
                    self.buffered_responses.lock().await.insert(got, Err(err));
                }
                Ok(Ok(Some(Frame::Event { .. }))) => {
                    // already routed by read_one_frame
                    continue;
                }
                Ok(Ok(Some(Frame::Unknown(_)))) => continue,
                Ok(Ok(None)) => {
                    self.mark_closed();
                    return Err(CdpError::Disconnected);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(CdpError::Timeout(format!("call {id} timed out"))),
            }
        }
    }

    /// Reads and decodes a single frame off the wire, routing events as a
    /// side effect. Returns `Ok(None)` if the stream has closed.
    async fn read_one_frame(&self) -> Result<Option<Frame>, CdpError> {
        let mut ws = self.ws.lock().await;
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let frame = Codec::decode(text.as_bytes());
                drop(ws);
                self.route_event(&frame).await;
                Ok(Some(frame))
            }
            Some(Ok(WsMessage::Binary(data))) => {
                let frame = Codec::decode(&data);
                drop(ws);
                self.route_event(&frame).await;
                Ok(Some(frame))
            }
            Some(Ok(WsMessage::Close(_))) => {
                self.mark_closed();
                Ok(None)
            }
            Some(Ok(_)) => Ok(Some(Frame::Unknown(bytes::Bytes::new()))),
            Some(Err(e)) => {
                self.mark_closed();
                Err(CdpError::ConnectionFailed(e.to_string()))
            }
            None => {
                self.mark_closed();
                Ok(None)
            }
        }
    }

    /// Dispatches an already-decoded event frame to its subscription, the
    /// browser-event buffer, or nowhere, per the dispatch rule in §4.2.
    async fn route_event(&self, frame: &Frame) {
        if let Frame::Event {
            method,
            params,
            session_id,
        } = frame
        {
            let event = ConnectionEvent {
                method: method.clone(),
                params: params.clone(),
                session_id: session_id.clone(),
            };
            match &event.session_id {
                Some(sid) => {
                    let subs = self.subscriptions.lock().await;
                    if let Some(tx) = subs.get(sid) {
                        // Overflow drops the newest enqueue with no error (§4.2).
                        let _ = tx.try_send(event);
                    }
                    // Unknown session: silently dropped.
                }
                None => {
                    self.browser_events.lock().await.push(event);
                }
            }
        }
    }

    /// Pumps exactly one frame off the wire for the caller's own
    /// multiplexing loop (the Manager). Events are already routed to their
    /// subscription as a side effect of this call; responses are handed
    /// back so the caller can route them to its own pending-reply table.
    pub async fn pump_message(&self) -> PumpOutcome {
        match self.read_one_frame().await {
            Ok(Some(Frame::Response { id, result })) => PumpOutcome::Response(id, Ok(result)),
            Ok(Some(Frame::ErrorResponse { id, error })) => {
                PumpOutcome::Response(id, Err(CdpError::from_remote(error.message, None)))
            }
            Ok(Some(Frame::Event { .. })) | Ok(Some(Frame::Unknown(_))) => PumpOutcome::Other,
            Ok(None) => PumpOutcome::Closed,
            Err(_) => PumpOutcome::Closed,
        }
    }

    /// Creates a bounded per-session event bus (default capacity 64).
    pub async fn subscribe(&self, session: SessionId, capacity: usize) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscriptions.lock().await.insert(session, tx);
        rx
    }

    pub async fn unsubscribe(&self, session: &SessionId) {
        self.subscriptions.lock().await.remove(session);
    }

    /// Returns and clears all response frames that arrived for identifiers
    /// other than the one a blocking `send` was waiting on.
    pub async fn drain_responses(&self) -> Vec<(CallId, Result<Value, CdpError>)> {
        self.buffered_responses.lock().await.drain().collect()
    }

    /// Drains any session-less events accumulated by [`Connection::route_event`].
    pub async fn drain_browser_events(&self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut *self.browser_events.lock().await)
    }

    /// Closes the underlying socket and latches `closed`, so all subsequent
    /// sends fail fast.
    pub async fn close(&self) {
        self.mark_closed();
        let mut ws = self.ws.lock().await;
        let _ = ws.close(None).await;
        self.subscriptions.lock().await.clear();
    }
}

pub type SharedConnection = Arc<Connection>;

/// Outcome of pumping one frame off the wire, distinguishing a routed
/// response from "nothing to route" and from a terminal disconnect so the
/// Manager's select loop never confuses the two.
#[derive(Debug)]
pub enum PumpOutcome {
    Response(CallId, Result<Value, CdpError>),
    Other,
    Closed,
}
