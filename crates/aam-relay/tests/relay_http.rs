use aam_client::{ClientConfig, MockConfig};
use aam_relay::{router, RelayConfig, RelaySession};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

fn relay_config(frames: Vec<String>, repeat: bool) -> RelayConfig {
    RelayConfig {
        gateway: ClientConfig {
            mock: Some(MockConfig {
                frames,
                interval: Duration::from_millis(20),
                repeat,
            }),
            ..ClientConfig::default()
        },
        ..RelayConfig::default()
    }
}

fn test_app() -> (Arc<RelaySession>, Router) {
    let session = RelaySession::new(relay_config(Vec::new(), false)).expect("session");
    let app = router(session.clone());
    (session, app)
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json body")
}

fn post_event(body: Value) -> Request<Body> {
    Request::builder()
        .uri("/api/events")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/ws")
}

async fn wait_for_clients(session: &RelaySession, count: usize) {
    tokio::time::timeout(WAIT, async {
        while session.client_count().await < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client registered");
}

#[tokio::test]
async fn health_reports_uptime_and_clients() {
    let (_session, app) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["clients"], 0);
    assert!(json["uptime"].is_number());
    let stamp = json["timestamp"].as_str().expect("timestamp string");
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
}

#[tokio::test]
async fn posting_a_valid_event_returns_created() {
    let (_session, app) = test_app();
    let response = app
        .oneshot(post_event(json!({
            "type": "agent_started",
            "agentId": "a1",
            "timestamp": 1_700_000_000_000i64,
            "data": {"model": "gpt-4"}
        })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        json_body(response).await,
        json!({"data": {"sent": true, "clients": 0}})
    );
}

#[tokio::test]
async fn posting_without_timestamp_uses_receive_time() {
    let (_session, app) = test_app();
    let response = app
        .oneshot(post_event(json!({
            "type": "heartbeat",
            "agentId": "a1",
            "data": {"status": "idle"}
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn posting_without_type_or_agent_id_is_a_validation_error() {
    for body in [
        json!({"agentId": "a1", "timestamp": 1}),
        json!({"type": "agent_started", "timestamp": 1}),
        json!({"type": "agent_started", "agentId": "", "timestamp": 1}),
        json!({"type": "bogus", "agentId": "a1", "timestamp": 1}),
    ] {
        let (_session, app) = test_app();
        let response = app.oneshot(post_event(body)).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
        assert!(json["error"]["message"].is_string());
    }
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let (_session, app) = test_app();
    let request = Request::builder()
        .uri("/api/events")
        .method(Method::POST)
        .body(Body::from("{not json"))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn stats_reports_connected_clients() {
    let (_session, app) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/stats")
                .method(Method::GET)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["data"]["connectedClients"], 0);
    assert!(json["data"]["uptime"].is_number());
    let memory = &json["data"]["memoryUsage"];
    assert!(memory.is_u64() || memory.is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn posted_events_reach_socket_clients() {
    let (session, app) = test_app();
    let url = serve(app.clone()).await;
    let (mut ws, _) = connect_async(url.as_str()).await.expect("connect");
    wait_for_clients(&session, 1).await;

    let response = app
        .oneshot(post_event(json!({
            "type": "tool_called",
            "agentId": "a1",
            "timestamp": 5,
            "data": {"toolName": "read"}
        })))
        .await
        .expect("response");
    assert_eq!(json_body(response).await["data"]["clients"], 1);

    let text = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("frame delivered");
    let envelope: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(envelope["type"], "agent_event");
    assert_eq!(envelope["payload"]["agentId"], "a1");
    assert_eq!(envelope["payload"]["data"]["toolName"], "read");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_frames_are_forwarded_and_stop_closes_clients() {
    let frame = json!({
        "type": "agent_event",
        "payload": {"type": "heartbeat", "agentId": "gw", "timestamp": 1, "data": {"status": "idle"}}
    })
    .to_string();
    let session = RelaySession::new(relay_config(vec![frame], true)).expect("session");
    session.start();
    let url = serve(router(session.clone())).await;
    let (mut ws, _) = connect_async(url.as_str()).await.expect("connect");
    wait_for_clients(&session, 1).await;

    let forwarded = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return text;
            }
        }
    })
    .await
    .expect("forwarded frame");
    let envelope: Value = serde_json::from_str(&forwarded).expect("json");
    assert_eq!(envelope["payload"]["agentId"], "gw");

    session.stop().await;
    assert_eq!(session.client_count().await, 0);
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("socket closed");
    assert!(closed);
}
