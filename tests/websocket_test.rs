use std::time::Duration;

use actix_web::App;
use futures_util::{SinkExt, StreamExt};
use match_server::app::{configure_app, Services};
use match_server::config::AppConfig;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> AppConfig {
    AppConfig {
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        auth_token_ttl_seconds: 3600,
        login_rate_window_seconds: 60,
        login_rate_limit_max: 20,
        ws_queue_limit_messages: 8,
        ws_queue_limit_bytes: 65536,
        match_queue_timeout_seconds: 10,
        session_tick_interval_ms: 300,
        session_max_ticks: 5,
        ops_token: String::new(),
    }
}

async fn start_server(config: AppConfig) -> actix_test::TestServer {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to create test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let services = Services::build(config, pool);
    actix_test::start(move || {
        let services = services.clone();
        App::new().configure(move |cfg| configure_app(cfg, &services))
    })
}

async fn register_and_login(srv: &actix_test::TestServer, username: &str) -> (i64, String) {
    let mut resp = srv
        .post("/api/auth/register")
        .send_json(&json!({"username": username, "password": "secret"}))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let body: Value = resp.json().await.unwrap();
    let user_id = body["data"]["userId"].as_i64().unwrap();

    let mut resp = srv
        .post("/api/auth/login")
        .send_json(&json!({"username": username, "password": "secret"}))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    (user_id, body["data"]["token"].as_str().unwrap().to_string())
}

async fn connect_ws(srv: &actix_test::TestServer, token: &str) -> Ws {
    let url = format!("ws://{}/ws", srv.addr());
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", token).parse().unwrap(),
    );
    let (stream, _) = connect_async(request).await.expect("ws connect failed");
    stream
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for ws frame")
            .expect("ws stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected ws frame: {:?}", other),
        }
    }
}

#[actix_rt::test]
async fn upgrade_requires_valid_bearer() {
    let srv = start_server(test_config()).await;

    let url = format!("ws://{}/ws", srv.addr());
    match connect_async(url.as_str().into_client_request().unwrap()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401 rejection, got {:?}", other.map(|_| ())),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Bearer bogus".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401 rejection, got {:?}", other.map(|_| ())),
    }
}

#[actix_rt::test]
async fn auth_state_and_echo_round_trip() {
    let srv = start_server(test_config()).await;
    let (user_id, token) = register_and_login(&srv, "alice").await;
    let mut ws = connect_ws(&srv, &token).await;

    let auth_state = next_json(&mut ws).await;
    assert_eq!(auth_state["t"], "event");
    assert_eq!(auth_state["event"], "auth_state");
    assert_eq!(auth_state["seq"], 0);
    assert_eq!(auth_state["p"]["userId"], user_id);
    assert_eq!(auth_state["p"]["username"], "alice");
    assert_eq!(auth_state["p"]["snapshotVersion"], 1);
    assert!(!auth_state["p"]["resumeToken"].as_str().unwrap().is_empty());

    send_json(
        &mut ws,
        json!({"t": "event", "seq": 7, "event": "echo", "p": {"message": "hello"}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["event"], "echo");
    assert_eq!(reply["seq"], 7);
    assert_eq!(reply["p"]["message"], "hello");
    assert_eq!(reply["p"]["userId"], user_id);

    send_json(
        &mut ws,
        json!({"t": "event", "seq": 8, "event": "echo", "p": {"note": "missing message"}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["t"], "error");
    assert_eq!(reply["seq"], 8);
    assert_eq!(reply["p"]["code"], "bad_request");

    send_json(
        &mut ws,
        json!({"t": "event", "seq": 9, "event": "no_such_event", "p": {}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["p"]["code"], "bad_request");
    assert_eq!(reply["seq"], 9);

    send_json(&mut ws, json!({"t": "bogus", "seq": 10, "p": {}})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["p"]["code"], "bad_request");
    assert_eq!(reply["seq"], 10);

    ws.send(Message::Text("not json".into())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["t"], "error");
    assert_eq!(reply["seq"], 0);
    assert_eq!(reply["p"]["code"], "bad_request");
}

#[actix_rt::test]
async fn resume_token_rotates_and_old_token_dies() {
    let srv = start_server(test_config()).await;
    let (user_id, token) = register_and_login(&srv, "alice").await;

    let mut first = connect_ws(&srv, &token).await;
    let auth_state = next_json(&mut first).await;
    let old_resume = auth_state["p"]["resumeToken"].as_str().unwrap().to_string();
    first.close(None).await.unwrap();

    let mut second = connect_ws(&srv, &token).await;
    let auth_state = next_json(&mut second).await;
    assert_ne!(auth_state["p"]["resumeToken"], old_resume.as_str());

    // The previous connection's token still identifies this user.
    send_json(
        &mut second,
        json!({"t": "event", "seq": 1, "event": "resync_request", "p": {"resumeToken": old_resume}}),
    )
    .await;
    let resync = next_json(&mut second).await;
    assert_eq!(resync["event"], "resync_state");
    assert_eq!(resync["seq"], 1);
    let new_resume = resync["p"]["resumeToken"].as_str().unwrap();
    assert_ne!(new_resume, old_resume);
    assert_eq!(resync["p"]["snapshot"]["version"], 1);
    assert_eq!(resync["p"]["snapshot"]["state"], "auth_only");
    assert_eq!(resync["p"]["snapshot"]["user"]["userId"], user_id);

    // Issuing invalidated it; the second use fails.
    send_json(
        &mut second,
        json!({"t": "event", "seq": 2, "event": "resync_request", "p": {"resumeToken": old_resume}}),
    )
    .await;
    let reply = next_json(&mut second).await;
    assert_eq!(reply["t"], "error");
    assert_eq!(reply["seq"], 2);
    assert_eq!(reply["p"]["code"], "invalid_resume_token");
}

#[actix_rt::test]
async fn resync_rejects_other_users_token() {
    let srv = start_server(test_config()).await;
    let (_alice_id, alice_token) = register_and_login(&srv, "alice").await;
    let (_bob_id, bob_token) = register_and_login(&srv, "bob").await;

    let mut alice = connect_ws(&srv, &alice_token).await;
    let alice_auth = next_json(&mut alice).await;
    let alice_resume = alice_auth["p"]["resumeToken"].as_str().unwrap().to_string();

    let mut bob = connect_ws(&srv, &bob_token).await;
    let _ = next_json(&mut bob).await;

    send_json(
        &mut bob,
        json!({"t": "event", "seq": 4, "event": "resync_request", "p": {"resumeToken": alice_resume}}),
    )
    .await;
    let reply = next_json(&mut bob).await;
    assert_eq!(reply["p"]["code"], "invalid_resume_token");
    assert_eq!(reply["seq"], 4);
}

#[actix_rt::test]
async fn overflowing_send_queue_closes_with_policy_error() {
    let mut config = test_config();
    config.ws_queue_limit_bytes = 1;
    let srv = start_server(config).await;
    let (_user_id, token) = register_and_login(&srv, "alice").await;

    // The auth_state frame alone exceeds the byte budget, so the server must
    // close instead of sending it.
    let mut ws = connect_ws(&srv, &token).await;
    let msg = timeout(Duration::from_secs(10), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("ws stream ended")
        .expect("ws read error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason.as_str(), "backpressure_exceeded");
        }
        other => panic!("expected policy close, got {:?}", other),
    }
}

#[actix_rt::test]
async fn input_without_session_is_rejected() {
    let srv = start_server(test_config()).await;
    let (_user_id, token) = register_and_login(&srv, "alice").await;
    let mut ws = connect_ws(&srv, &token).await;
    let _ = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({
            "t": "event", "seq": 5, "event": "session.input",
            "p": {"sessionId": "session-999", "sequence": 1, "targetTick": 1, "delta": 1},
        }),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["t"], "error");
    assert_eq!(reply["seq"], 5);
    assert_eq!(reply["p"]["code"], "session_not_found");

    send_json(
        &mut ws,
        json!({"t": "event", "seq": 6, "event": "session.input", "p": {"sessionId": "x"}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["p"]["code"], "bad_request");
}

#[actix_rt::test]
async fn queue_timeout_reaches_waiting_client() {
    let srv = start_server(test_config()).await;
    let (_user_id, token) = register_and_login(&srv, "alice").await;
    let mut ws = connect_ws(&srv, &token).await;
    let _ = next_json(&mut ws).await;

    let mut resp = srv
        .post("/api/queue/join")
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .send_json(&json!({"mode": "normal", "timeoutSeconds": 1}))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["queued"], true);

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["t"], "error");
    assert_eq!(frame["seq"], 0);
    assert_eq!(frame["p"]["code"], "queue_timeout");

    let mut resp = srv.get("/metrics").send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["queue"]["length"], 0);
}

#[actix_rt::test]
async fn full_match_flow_updates_leaderboard() {
    let srv = start_server(test_config()).await;
    let (alice_id, alice_token) = register_and_login(&srv, "alice").await;
    let (bob_id, bob_token) = register_and_login(&srv, "bob").await;

    let mut alice = connect_ws(&srv, &alice_token).await;
    let mut bob = connect_ws(&srv, &bob_token).await;
    let _ = next_json(&mut alice).await;
    let _ = next_json(&mut bob).await;

    for token in [&alice_token, &bob_token] {
        let resp = srv
            .post("/api/queue/join")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .send_json(&json!({"mode": "normal", "timeoutSeconds": 5}))
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    let created_alice = next_json(&mut alice).await;
    assert_eq!(created_alice["event"], "session.created");
    let session_id = created_alice["p"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(
        created_alice["p"]["participants"].as_array().unwrap().len(),
        2
    );
    let created_bob = next_json(&mut bob).await;
    assert_eq!(created_bob["p"]["sessionId"], session_id.as_str());

    let started_alice = next_json(&mut alice).await;
    assert_eq!(started_alice["event"], "session.started");
    assert_eq!(started_alice["p"]["tick"], 0);
    assert_eq!(started_alice["p"]["tickIntervalMs"], 300);
    let started_bob = next_json(&mut bob).await;
    assert_eq!(started_bob["event"], "session.started");

    send_json(
        &mut alice,
        json!({
            "t": "event", "seq": 11, "event": "session.input",
            "p": {"sessionId": session_id, "sequence": 1, "targetTick": 1, "delta": 1},
        }),
    )
    .await;
    send_json(
        &mut bob,
        json!({
            "t": "event", "seq": 21, "event": "session.input",
            "p": {"sessionId": session_id, "sequence": 1, "targetTick": 1, "delta": 1},
        }),
    )
    .await;

    for tick in 1..=5u64 {
        for ws in [&mut alice, &mut bob] {
            let state = next_json(ws).await;
            assert_eq!(state["event"], "session.state", "frame at tick {}", tick);
            assert_eq!(state["p"]["tick"], tick);
            assert!(state["p"]["issuedAt"].is_string());
            let players = state["p"]["players"].as_array().unwrap();
            assert_eq!(players.len(), 2);
            // Both inputs targeted tick 1, so from then on both sit at 1.
            for player in players {
                assert_eq!(player["position"], 1);
                assert_eq!(player["lastSequence"], 1);
            }
        }
    }

    for ws in [&mut alice, &mut bob] {
        let ended = next_json(ws).await;
        assert_eq!(ended["event"], "session.ended");
        assert_eq!(ended["p"]["reason"], "completed");
        assert_eq!(ended["p"]["result"]["ticks"], 5);
        // Tied positions award the lower user id.
        assert_eq!(ended["p"]["result"]["winnerUserId"], alice_id);
    }

    // The session is gone; further input resolves no session.
    send_json(
        &mut alice,
        json!({
            "t": "event", "seq": 12, "event": "session.input",
            "p": {"sessionId": session_id, "sequence": 2, "targetTick": 9, "delta": 1},
        }),
    )
    .await;
    let reply = next_json(&mut alice).await;
    assert_eq!(reply["p"]["code"], "session_not_found");

    // Finalize runs right after the broadcast; poll until it lands.
    let mut alice_entry = Value::Null;
    let mut bob_entry = Value::Null;
    for _ in 0..50 {
        let mut resp = srv.get("/api/leaderboard").send().await.unwrap();
        let body: Value = resp.json().await.unwrap();
        let entries = body["data"]["entries"].as_array().unwrap().clone();
        alice_entry = entries
            .iter()
            .find(|e| e["userId"] == alice_id)
            .cloned()
            .unwrap_or(Value::Null);
        bob_entry = entries
            .iter()
            .find(|e| e["userId"] == bob_id)
            .cloned()
            .unwrap_or(Value::Null);
        if alice_entry["wins"] == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(alice_entry["rating"], 1016);
    assert_eq!(alice_entry["wins"], 1);
    assert_eq!(alice_entry["rank"], 1);
    assert_eq!(bob_entry["rating"], 984);
    assert_eq!(bob_entry["losses"], 1);
}
