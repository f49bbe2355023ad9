//! The tab handle (§4.5): the public surface an owner uses to drive one tab,
//! built entirely on [`ManagerHandle::command`] plus the event stream the
//! Manager forwards for this tab's session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{CdpError, ErrorKind};
use crate::fetch::{Download, FetchController, InterceptAction, RequestPaused, ResourceType, StateTransition};
use crate::manager::ManagerHandle;
use crate::protocol::{CreatedInfo, OwnerMessage, TabOptions};
use crate::types::{BrowserContextId, OwnerId, SessionId, TargetId};

struct Inner {
    handle: ManagerHandle,
    owner: OwnerId,
    session: SessionId,
    target: TargetId,
    context: BrowserContextId,
    events: broadcast::Sender<OwnerMessage>,
    fetch: Mutex<FetchController>,
}

impl Inner {
    async fn call(&self, method: impl Into<String>, params: Value, timeout: Duration) -> Result<Value, CdpError> {
        self.handle
            .command(self.owner, self.session.clone(), method, params, timeout)
            .await
    }

    /// Decides and carries out the CDP follow-up for one `Fetch.requestPaused`
    /// event, delivering captured bytes to an in-flight `expect_download`
    /// waiter if one is registered (§4.5).
    async fn handle_request_paused(&self, params: &Value) {
        let Some(request_id) = params.get("requestId").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let event = parse_request_paused(&request_id, params);

        let action = self.fetch.lock().await.on_request_paused(&event);
        let timeout = Duration::from_secs(30);

        match action {
            InterceptAction::ContinueRequest => {
                let _ = self
                    .call("Fetch.continueRequest", json!({"requestId": request_id}), timeout)
                    .await;
            }
            InterceptAction::FailRequest { reason } => {
                let _ = self
                    .call(
                        "Fetch.failRequest",
                        json!({"requestId": request_id, "errorReason": reason}),
                        timeout,
                    )
                    .await;
            }
            InterceptAction::FetchBodyThenFulfill { .. } => {
                let result = self
                    .call("Fetch.getResponseBody", json!({"requestId": request_id}), timeout)
                    .await
                    .and_then(|body| build_download(&event, &body));

                let fulfilled = self
                    .call(
                        "Fetch.fulfillRequest",
                        json!({
                            "requestId": request_id,
                            // Always 200 regardless of the original response
                            // status, to suppress on-disk persistence (§4.5).
                            "responseCode": 200,
                        }),
                        timeout,
                    )
                    .await;

                let outcome = match (result, fulfilled) {
                    (Ok(download), Ok(_)) => Ok(download),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                };
                self.fetch.lock().await.deliver_download(outcome);
            }
        }
    }

    async fn apply_transition(&self, transition: StateTransition) -> Result<(), CdpError> {
        if transition.disable {
            self.call("Fetch.disable", json!({}), Duration::from_secs(10)).await?;
        }
        if let Some(patterns) = transition.enable_patterns {
            self.call(
                "Fetch.enable",
                json!({"patterns": patterns}),
                Duration::from_secs(10),
            )
            .await?;
        }
        Ok(())
    }
}

/// Outcome of [`Tab::goto`]: the navigated-to URL plus whatever frame/loader
/// identifiers the browser's `Page.navigate` response carried.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub url: String,
    pub frame_id: Option<String>,
    pub loader_id: Option<String>,
}

/// A single open tab, owned by whichever caller created it. Dropping a `Tab`
/// tells the Manager this owner is gone: its event pump task is aborted,
/// which drops the receiving half of its owner channel and unblocks the
/// Manager's liveness wait (§4.4).
pub struct Tab {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl Tab {
    /// Requests a new tab from the Manager and wires up its event pump.
    pub async fn create(handle: &ManagerHandle, options: TabOptions) -> Result<Self, CdpError> {
        let owner = handle.alloc_owner();
        let (owner_tx, mut owner_rx) = tokio::sync::mpsc::channel(handle.event_bus_capacity);
        let CreatedInfo {
            session,
            target,
            context,
        } = handle.create(owner, options, owner_tx).await?;

        let (events_tx, _) = broadcast::channel(handle.event_bus_capacity.max(16));
        let inner = Arc::new(Inner {
            handle: handle.clone(),
            owner,
            session: session.clone(),
            target,
            context,
            events: events_tx,
            fetch: Mutex::new(FetchController::new(session)),
        });

        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = owner_rx.recv().await {
                if let OwnerMessage::Event { ref method, ref params, .. } = msg {
                    if method == "Fetch.requestPaused" {
                        pump_inner.handle_request_paused(params).await;
                    }
                }
                let _ = pump_inner.events.send(msg);
            }
        });

        Ok(Self { inner, pump })
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn target(&self) -> &TargetId {
        &self.inner.target
    }

    pub fn context(&self) -> &BrowserContextId {
        &self.inner.context
    }

    /// Issues a raw CDP command against this tab's session, using the
    /// configured default command timeout.
    pub async fn execute(&self, method: impl Into<String>, params: Value) -> Result<Value, CdpError> {
        let timeout = self.inner.handle.default_command_timeout;
        self.execute_with_timeout(method, params, timeout).await
    }

    pub async fn execute_with_timeout(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        self.inner.call(method, params, timeout).await
    }

    /// Navigates and waits for the page's load event (§4.5 convenience
    /// wrapper over the core command/event primitives).
    ///
    /// Subscribes to this tab's event stream *before* issuing `Page.navigate`
    /// so a load event racing ahead of the navigate reply is never missed —
    /// the broadcast channel retains it until we're ready to read it.
    pub async fn goto(&self, url: impl Into<String>) -> Result<Navigation, CdpError> {
        let url = url.into();
        let mut rx = self.inner.events.subscribe();
        let timeout = self.inner.handle.default_navigation_timeout;

        let result = self.execute("Page.navigate", json!({"url": url.clone()})).await?;
        if let Some(err) = result.get("errorText").and_then(Value::as_str) {
            return Err(CdpError::from_remote(format!("net::{err}"), Some("Page.navigate")));
        }

        Self::wait_on(&mut rx, "Page.loadEventFired", timeout).await?;

        Ok(Navigation {
            url,
            frame_id: result.get("frameId").and_then(Value::as_str).map(str::to_string),
            loader_id: result.get("loaderId").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Drives an already-subscribed receiver until `method` arrives and
    /// `predicate` accepts its params, per the event-wait loop semantics in
    /// §4.5.
    async fn wait_on_matching(
        rx: &mut broadcast::Receiver<OwnerMessage>,
        method: &str,
        predicate: impl Fn(&Value) -> bool,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(OwnerMessage::Event { method: m, params, .. }) if m == method && predicate(&params) => {
                        return Ok(params)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(CdpError::Disconnected),
                }
            }
        })
        .await
        .map_err(|_| CdpError::Timeout(format!("waiting for event '{method}'")))?
    }

    async fn wait_on(rx: &mut broadcast::Receiver<OwnerMessage>, method: &str, timeout: Duration) -> Result<Value, CdpError> {
        Self::wait_on_matching(rx, method, |_| true, timeout).await
    }

    /// Resolves a CSS selector to a DOM node id, or `ELEMENT_NOT_FOUND`.
    pub async fn find_element(&self, selector: &str) -> Result<i64, CdpError> {
        let doc = self.execute("DOM.getDocument", json!({"depth": 0})).await?;
        let root_id = doc["root"]["nodeId"]
            .as_i64()
            .ok_or_else(|| CdpError::Invalid("DOM.getDocument: missing root nodeId".into()))?;
        let result = self
            .execute("DOM.querySelector", json!({"nodeId": root_id, "selector": selector}))
            .await?;
        match result["nodeId"].as_i64() {
            Some(0) | None => Err(CdpError::Classified(
                ErrorKind::ElementNotFound,
                format!("no element matching '{selector}'"),
            )),
            Some(node_id) => Ok(node_id),
        }
    }

    /// Evaluates a JS expression in the page's main world.
    pub async fn evaluate(&self, expression: impl Into<String>) -> Result<Value, CdpError> {
        let result = self
            .execute(
                "Runtime.evaluate",
                json!({"expression": expression.into(), "returnByValue": true, "awaitPromise": true}),
            )
            .await?;
        if let Some(exc) = result.get("exceptionDetails") {
            let message = exc
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| exc.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation threw")
                .to_string();
            return Err(CdpError::Classified(ErrorKind::EvalError, message));
        }
        Ok(result["result"]["value"].clone())
    }

    pub async fn get_cookies(&self) -> Result<Value, CdpError> {
        let result = self.execute("Network.getCookies", json!({})).await?;
        Ok(result["cookies"].clone())
    }

    /// Captures a PNG screenshot of the current viewport.
    pub async fn screenshot(&self) -> Result<Vec<u8>, CdpError> {
        let result = self.execute("Page.captureScreenshot", json!({"format": "png"})).await?;
        decode_base64_field(&result, "data")
    }

    /// Renders the page to PDF with the browser's defaults.
    pub async fn pdf(&self) -> Result<Vec<u8>, CdpError> {
        let result = self.execute("Page.printToPDF", json!({})).await?;
        decode_base64_field(&result, "data")
    }

    /// Resolves `selector` and dispatches a synthetic click at its center.
    pub async fn click(&self, selector: &str) -> Result<(), CdpError> {
        let node_id = self.find_element(selector).await?;
        let model = self.execute("DOM.getBoxModel", json!({"nodeId": node_id})).await?;
        let quad = model["model"]["content"]
            .as_array()
            .ok_or_else(|| CdpError::Classified(ErrorKind::ElementNotVisible, selector.to_string()))?;
        if quad.len() < 8 {
            return Err(CdpError::Classified(ErrorKind::ElementNotVisible, selector.to_string()));
        }
        let x = (quad[0].as_f64().unwrap_or(0.0) + quad[4].as_f64().unwrap_or(0.0)) / 2.0;
        let y = (quad[1].as_f64().unwrap_or(0.0) + quad[5].as_f64().unwrap_or(0.0)) / 2.0;

        for kind in ["mousePressed", "mouseReleased"] {
            self.execute(
                "Input.dispatchMouseEvent",
                json!({"type": kind, "x": x, "y": y, "button": "left", "clickCount": 1}),
            )
            .await?;
        }
        Ok(())
    }

    /// Focuses `selector` and types `text` one key event at a time.
    pub async fn type_text(&self, selector: &str, text: &str) -> Result<(), CdpError> {
        let node_id = self.find_element(selector).await?;
        self.execute("DOM.focus", json!({"nodeId": node_id})).await?;
        self.execute("Input.insertText", json!({"text": text})).await?;
        Ok(())
    }

    /// Waits for the next occurrence of `method` on this tab's event stream.
    ///
    /// Subscribes only at call time: if `method` may already be racing ahead
    /// of whatever triggers it, subscribe earlier (see [`Tab::goto`]) and
    /// drive the receiver directly instead.
    pub async fn wait_for_event(&self, method: &str, timeout: Duration) -> Result<Value, CdpError> {
        let mut rx = self.inner.events.subscribe();
        Self::wait_on(&mut rx, method, timeout).await
    }

    /// Waits for the next occurrence of `method` whose params satisfy
    /// `predicate` (§4.5's "optional predicate" on the event-wait loop).
    pub async fn wait_for_event_matching(
        &self,
        method: &str,
        predicate: impl Fn(&Value) -> bool,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let mut rx = self.inner.events.subscribe();
        Self::wait_on_matching(&mut rx, method, predicate, timeout).await
    }

    /// Restricts which resource types the browser may load on this tab.
    pub async fn block_resources(&self, types: HashSet<ResourceType>) -> Result<(), CdpError> {
        let transition = self.inner.fetch.lock().await.block_resources(types);
        self.inner.apply_transition(transition).await
    }

    /// Arms download capture, runs `action`, and waits up to `timeout` for a
    /// download to land, then disarms. Only one capture may be in flight per
    /// tab.
    ///
    /// `action` and the download wait race each other (§4.5, "action-function
    /// error propagation"): if `action` returns an error, the wait aborts
    /// immediately with that error rather than sitting out the timeout. If
    /// `action` succeeds, the wait continues racing the deadline and the
    /// download arriving.
    pub async fn expect_download<F, Fut, T>(&self, timeout: Duration, action: F) -> Result<Download, CdpError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, CdpError>>,
    {
        // Stop the browser from auto-saving the download to disk before the
        // controller gets a chance to intercept and fulfill it itself.
        self.inner
            .call(
                "Page.setDownloadBehavior",
                json!({"behavior": "allow"}),
                Duration::from_secs(10),
            )
            .await?;

        let (tx, rx) = oneshot::channel();
        {
            let mut fetch = self.inner.fetch.lock().await;
            let transition = fetch.begin_expect_download();
            fetch.awaiting_download(tx);
            drop(fetch);
            self.inner.apply_transition(transition).await?;
        }

        let action_fut = action();
        tokio::pin!(action_fut);
        tokio::pin!(rx);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        let mut action_finished = false;
        let outcome = loop {
            tokio::select! {
                res = &mut action_fut, if !action_finished => {
                    action_finished = true;
                    if let Err(e) = res {
                        break Err(e);
                    }
                    // action succeeded: keep racing the download against the deadline.
                }
                download = &mut rx => {
                    break match download {
                        Ok(result) => result,
                        Err(_) => Err(CdpError::DownloadFailed("download channel closed before delivery".into())),
                    };
                }
                _ = &mut sleep => {
                    break Err(CdpError::DownloadTimeout(format!("{:.1}s", timeout.as_secs_f64())));
                }
            }
        };

        let transition = self.inner.fetch.lock().await.end_expect_download();
        self.inner.apply_transition(transition).await?;

        outcome
    }

    pub async fn close(&self) {
        self.inner.handle.close(self.inner.session.clone()).await;
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn decode_base64_field(value: &Value, field: &str) -> Result<Vec<u8>, CdpError> {
    let raw = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CdpError::Invalid(format!("response missing '{field}'")))?;
    BASE64
        .decode(raw)
        .map_err(|e| CdpError::Invalid(format!("invalid base64 in '{field}': {e}")))
}

fn parse_request_paused(request_id: &str, params: &Value) -> RequestPaused {
    let stage_is_response = params.get("responseStatusCode").is_some() || params.get("responseHeaders").is_some();
    let response_headers: Vec<(String, String)> = params["responseHeaders"]
        .as_array()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    let name = h.get("name")?.as_str()?.to_string();
                    let value = h.get("value")?.as_str()?.to_string();
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default();
    let resource_type = match params.get("resourceType").and_then(Value::as_str) {
        Some("Image") => ResourceType::Image,
        Some("Stylesheet") => ResourceType::Stylesheet,
        Some("Script") => ResourceType::Script,
        Some("Font") => ResourceType::Font,
        Some("Media") => ResourceType::Media,
        Some("XHR") => ResourceType::Xhr,
        _ => ResourceType::Other("Other"),
    };
    RequestPaused {
        request_id: request_id.to_string(),
        resource_type,
        stage_is_response,
        response_headers,
        response_status_code: params.get("responseStatusCode").and_then(Value::as_i64),
    }
}

fn build_download(event: &RequestPaused, body: &Value) -> Result<Download, CdpError> {
    let (filename, mime_type) = FetchController::download_metadata(event).unwrap_or((None, None));
    let base64_encoded = body["base64Encoded"].as_bool().unwrap_or(true);
    let raw = body["body"].as_str().unwrap_or("");
    let data = if base64_encoded {
        BASE64
            .decode(raw)
            .map_err(|e| CdpError::DownloadFailed(format!("invalid base64 body: {e}")))?
    } else {
        raw.as_bytes().to_vec()
    };
    let size = data.len();
    Ok(Download {
        data,
        filename,
        mime_type,
        size,
    })
}
