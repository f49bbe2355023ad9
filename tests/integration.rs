//! End-to-end scenarios (S1-S6, SPEC_FULL.md §8) against an in-process mock
//! CDP server: a single `TcpListener` that serves the HTTP discovery
//! response once, then upgrades the next connection to a WebSocket and
//! scripts the browser side of the exchange by hand.

use std::collections::HashSet;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use cdp_core::config::Config;
use cdp_core::error::CdpError;
use cdp_core::fetch::ResourceType;
use cdp_core::manager;
use cdp_core::protocol::TabOptions;
use cdp_core::tab::Tab;

type Ws = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

/// Answers exactly one `GET /json/version` with a `webSocketDebuggerUrl`
/// pointing back at `address` on `ws_path`.
async fn serve_discovery(listener: &TcpListener, ws_path: &str, address: &str) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 4096];
    let _ = stream.read(&mut buf).await;
    let ws_url = format!("ws://{address}{ws_path}");
    let body = json!({ "webSocketDebuggerUrl": ws_url }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    let _ = stream.shutdown().await;
}

async fn accept_ws(listener: &TcpListener) -> Ws {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("mock server read error: {e}"),
            None => panic!("mock server: client closed unexpectedly"),
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

/// Plays out the standard create-target control-plane sequence (§4.4):
/// `createBrowserContext` -> `createTarget` -> `attachToTarget` -> four
/// domain enables, replying to each with the supplied identifiers.
async fn serve_create_tab(ws: &mut Ws, context_id: &str, target_id: &str, session_id: &str) {
    let req = recv_json(ws).await;
    assert_eq!(req["method"], "Target.createBrowserContext");
    send_json(ws, json!({"id": req["id"], "result": {"browserContextId": context_id}})).await;

    let req = recv_json(ws).await;
    assert_eq!(req["method"], "Target.createTarget");
    send_json(ws, json!({"id": req["id"], "result": {"targetId": target_id}})).await;

    let req = recv_json(ws).await;
    assert_eq!(req["method"], "Target.attachToTarget");
    send_json(ws, json!({"id": req["id"], "result": {"sessionId": session_id}})).await;

    for domain in ["Page", "Runtime", "Network", "DOM"] {
        let req = recv_json(ws).await;
        assert_eq!(req["method"], format!("{domain}.enable"));
        send_json(ws, json!({"id": req["id"], "result": {}})).await;
    }
}

/// Reads one request and replies `{}` to it, asserting its method.
async fn expect_and_ack(ws: &mut Ws, method: &str) -> Value {
    let req = recv_json(ws).await;
    assert_eq!(req["method"], method);
    send_json(ws, json!({"id": req["id"], "result": {}})).await;
    req
}

#[tokio::test]
async fn s1_simple_navigate() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;

        let nav = recv_json(&mut ws).await;
        assert_eq!(nav["method"], "Page.navigate");
        assert_eq!(nav["params"]["url"], "https://example.com");
        send_json(
            &mut ws,
            json!({"id": nav["id"], "result": {"frameId": "f1", "loaderId": "l1"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"method": "Page.loadEventFired", "params": {}, "sessionId": "s1"}),
        )
        .await;
    });

    let config = Config::builder().address(address).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab = Tab::create(&handle, TabOptions::default()).await.unwrap();

    let nav = tab.goto("https://example.com").await.unwrap();
    assert_eq!(nav.url, "https://example.com");
    assert_eq!(nav.frame_id.as_deref(), Some("f1"));
    assert_eq!(nav.loader_id.as_deref(), Some("l1"));
    assert_eq!(tab.session().as_str(), "s1");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn s2_command_multiplexing_reordered_replies() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;
        serve_create_tab(&mut ws, "c2", "t2", "s2").await;

        let req_first = recv_json(&mut ws).await;
        let req_second = recv_json(&mut ws).await;

        // Reply to the *second* request first: replies arrive out of order,
        // but each owner must still get back its own result.
        send_json(
            &mut ws,
            json!({"id": req_second["id"], "result": {"echo": req_second["method"]}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"id": req_first["id"], "result": {"echo": req_first["method"]}}),
        )
        .await;
    });

    let config = Config::builder().address(address).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab_a = Tab::create(&handle, TabOptions::default()).await.unwrap();
    let tab_b = Tab::create(&handle, TabOptions::default()).await.unwrap();

    let (res_a, res_b) = tokio::join!(
        tab_a.execute("Foo.alpha", json!({})),
        tab_b.execute("Foo.beta", json!({})),
    );

    assert_eq!(res_a.unwrap()["echo"], "Foo.alpha");
    assert_eq!(res_b.unwrap()["echo"], "Foo.beta");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn s3_cap_and_waiter_fifo() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;
        // Owner exit on tab 1 closes it out on the wire before the waiter's
        // slot opens up.
        expect_and_ack(&mut ws, "Target.detachFromTarget").await;
        expect_and_ack(&mut ws, "Target.closeTarget").await;
        expect_and_ack(&mut ws, "Target.disposeBrowserContext").await;
        // Only now does the freed slot let the waiter's create go through.
        serve_create_tab(&mut ws, "c2", "t2", "s2").await;
    });

    let config = Config::builder().address(address).max_tabs(1).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();

    let tab1 = Tab::create(&handle, TabOptions::default()).await.unwrap();
    assert_eq!(tab1.session().as_str(), "s1");

    let handle2 = handle.clone();
    let waiter = tokio::spawn(async move { Tab::create(&handle2, TabOptions::default()).await });

    // Give the waiter a moment to be enqueued behind the cap before the slot
    // frees, so this genuinely exercises the queued path rather than a race
    // that happens to land after the cap is already clear.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(tab1);

    let tab2 = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(tab2.session().as_str(), "s2");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn s4_disconnect_fails_pending_then_reconnected_manager_creates() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;
        serve_create_tab(&mut ws, "c2", "t2", "s2").await;

        let _in_flight_a = recv_json(&mut ws).await;
        let _in_flight_b = recv_json(&mut ws).await;
        ws.close(None).await.ok();
        drop(ws);

        // The Manager notices the closed stream and bootstraps a fresh
        // Connection against the same address.
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws2 = accept_ws(&listener).await;
        serve_create_tab(&mut ws2, "c3", "t3", "s3").await;
    });

    let config = Config::builder()
        .address(address)
        .health_interval("3600s")
        .build()
        .unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab1 = Tab::create(&handle, TabOptions::default()).await.unwrap();
    let tab2 = Tab::create(&handle, TabOptions::default()).await.unwrap();

    let (r1, r2) = tokio::join!(
        tab1.execute("Foo.one", json!({})),
        tab2.execute("Foo.two", json!({})),
    );
    assert!(matches!(r1.unwrap_err(), CdpError::Disconnected));
    assert!(matches!(r2.unwrap_err(), CdpError::Disconnected));

    // Give the Manager's select loop a beat to finish the reconnect before
    // the next create lands.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tab3 = Tab::create(&handle, TabOptions::default()).await.unwrap();
    assert_eq!(tab3.session().as_str(), "s3");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn s5_download_capture_composes_with_blocking() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;

        // block_resources([Image]): Off -> BlockingOnly, no prior state to
        // disable, just one Fetch.enable(Request).
        let req = expect_and_ack(&mut ws, "Fetch.enable").await;
        assert_eq!(req["params"]["patterns"].as_array().unwrap().len(), 1);

        // expect_download first flips the browser's download-allow policy...
        expect_and_ack(&mut ws, "Page.setDownloadBehavior").await;

        // ...then begin_expect_download(): BlockingOnly -> Both, disable then
        // re-enable with both patterns.
        expect_and_ack(&mut ws, "Fetch.disable").await;
        let req = expect_and_ack(&mut ws, "Fetch.enable").await;
        assert_eq!(req["params"]["patterns"].as_array().unwrap().len(), 2);

        // The browser pauses a response that looks like a download.
        send_json(
            &mut ws,
            json!({
                "method": "Fetch.requestPaused",
                "sessionId": "s1",
                "params": {
                    "requestId": "r1",
                    "resourceType": "Document",
                    "responseStatusCode": 206,
                    "responseHeaders": [
                        {"name": "Content-Disposition", "value": "attachment; filename=\"r.pdf\""},
                        {"name": "Content-Type", "value": "application/pdf"},
                    ],
                },
            }),
        )
        .await;

        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "Fetch.getResponseBody");
        assert_eq!(req["params"]["requestId"], "r1");
        let body_b64 = BASE64.encode(b"PDFBYTES");
        send_json(
            &mut ws,
            json!({"id": req["id"], "result": {"body": body_b64, "base64Encoded": true}}),
        )
        .await;

        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "Fetch.fulfillRequest");
        // Always 200 to suppress on-disk persistence, even though the real
        // response above was a 206.
        assert_eq!(req["params"]["responseCode"], 200);
        send_json(&mut ws, json!({"id": req["id"], "result": {}})).await;

        // end_expect_download(): Both -> BlockingOnly (the prior steady
        // state), disable then re-enable with the request-only pattern.
        expect_and_ack(&mut ws, "Fetch.disable").await;
        let req = expect_and_ack(&mut ws, "Fetch.enable").await;
        assert_eq!(req["params"]["patterns"].as_array().unwrap().len(), 1);
    });

    let config = Config::builder().address(address).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab = Tab::create(&handle, TabOptions::default()).await.unwrap();

    tab.block_resources(HashSet::from([ResourceType::Image]))
        .await
        .unwrap();

    let download = tab
        .expect_download(Duration::from_secs(5), || async { Ok::<(), CdpError>(()) })
        .await
        .unwrap();

    assert_eq!(download.data, b"PDFBYTES".to_vec());
    assert_eq!(download.filename.as_deref(), Some("r.pdf"));
    assert_eq!(download.mime_type.as_deref(), Some("application/pdf"));
    assert_eq!(download.size, 8);

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn s6_error_classification_end_to_end() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;

        let req1 = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"id": req1["id"], "error": {"code": -32000, "message": "Session with given id not found"}}),
        )
        .await;

        let req2 = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"id": req2["id"], "error": {"code": -32000, "message": "net::ERR_NAME_NOT_RESOLVED"}}),
        )
        .await;
    });

    let config = Config::builder().address(address).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab = Tab::create(&handle, TabOptions::default()).await.unwrap();

    let err1 = tab.execute("Network.getCookies", json!({})).await.unwrap_err();
    assert!(err1.to_string().starts_with("TAB_CLOSED:"));

    let err2 = tab
        .execute("Page.navigate", json!({"url": "https://nope.invalid"}))
        .await
        .unwrap_err();
    assert!(err2.to_string().starts_with("NAVIGATION_FAILED:"));

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn wait_for_event_matching_skips_non_matching_occurrences() {
    let (listener, address) = bind().await;
    let ws_path = "/devtools/browser/mock";

    let server_address = address.clone();
    let server = tokio::spawn(async move {
        serve_discovery(&listener, ws_path, &server_address).await;
        let mut ws = accept_ws(&listener).await;
        serve_create_tab(&mut ws, "c1", "t1", "s1").await;

        send_json(
            &mut ws,
            json!({"method": "Network.responseReceived", "params": {"requestId": "r1"}, "sessionId": "s1"}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"method": "Network.responseReceived", "params": {"requestId": "r2"}, "sessionId": "s1"}),
        )
        .await;
    });

    let config = Config::builder().address(address).build().unwrap();
    let (handle, _join) = manager::spawn(config).await.unwrap();
    let tab = Tab::create(&handle, TabOptions::default()).await.unwrap();

    let params = tab
        .wait_for_event_matching(
            "Network.responseReceived",
            |p| p["requestId"] == "r2",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(params["requestId"], "r2");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
