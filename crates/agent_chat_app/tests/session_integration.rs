//! Chat sessions against an in-process WebSocket agent (no mocks): turns,
//! transcript persistence, resume on start or on announcement, reconnect
//! mid-stream, cancel.

use agent_chat_app::{ChatSession, SqliteTranscript, SUBMIT_TRIGGER};
use agent_chat_client::{Config, Role, TranscriptStore};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type Ws = WebSocketStream<tokio::net::TcpStream>;

fn chunk(id: &str, body: &str, done: bool) -> Message {
    Message::Text(
        serde_json::json!({"type": "response_chunk", "id": id, "body": body, "done": done})
            .to_string(),
    )
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, format!("ws://127.0.0.1:{}", port))
}

async fn accept(listener: &TcpListener) -> Ws {
    let (tcp, _) = listener.accept().await.unwrap();
    accept_async(tcp).await.unwrap()
}

/// Next text frame as JSON; `None` once the client goes away.
async fn next_json(ws: &mut Ws) -> Option<serde_json::Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return Some(serde_json::from_str(&text).unwrap());
        }
    }
    None
}

/// Next frame of `kind`, skipping others (e.g. resume requests).
async fn next_of_kind(ws: &mut Ws, kind: &str) -> serde_json::Value {
    loop {
        let frame = next_json(ws).await.expect("client disconnected");
        if frame["type"] == kind {
            return frame;
        }
    }
}

fn config(url: &str) -> Config {
    let mut config = Config::default();
    config.server.url = Some(url.to_string());
    config.transport.resume_timeout_ms = Some(100);
    config
}

async fn session(url: &str) -> ChatSession {
    let store = SqliteTranscript::open_in_memory().unwrap();
    ChatSession::with_store(config(url), store).await.unwrap()
}

#[tokio::test]
async fn turn_is_streamed_and_persisted() {
    let (listener, url) = listen().await;
    let (payloads_tx, mut payloads) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        for answer in ["Hello there", "Again"] {
            let request = next_of_kind(&mut ws, "send_request").await;
            payloads_tx.send(request.clone()).unwrap();
            let id = request["id"].as_str().unwrap().to_string();
            let (head, tail) = answer.split_at(answer.len() / 2);
            ws.send(chunk(&id, head, false)).await.unwrap();
            ws.send(chunk(&id, tail, true)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session = session(&url).await;
    let mut streamed = Vec::new();
    let reply = session
        .ask("Hi?", |c| streamed.push(c.body.clone()))
        .await
        .unwrap();
    assert!(reply.is_complete());
    assert_eq!(reply.answer, "Hello there");
    assert_eq!(streamed.concat(), "Hello there");

    let first = payloads.recv().await.unwrap();
    assert_eq!(first["trigger"], SUBMIT_TRIGGER);
    let payload: serde_json::Value =
        serde_json::from_str(first["payload"].as_str().unwrap()).unwrap();
    assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    assert_eq!(payload["messages"][0]["role"], "user");

    session.ask("And?", |_| {}).await.unwrap();
    let second = payloads.recv().await.unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(second["payload"].as_str().unwrap()).unwrap();
    let roles: Vec<_> = payload["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "user"]);

    let stored = session.store().load().unwrap();
    let roles: Vec<_> = stored.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(stored[3].text(), "Again");
}

#[tokio::test]
async fn server_error_is_reported_and_question_kept() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_of_kind(&mut ws, "send_request").await;
        let error = serde_json::json!({
            "type": "response_chunk", "id": request["id"], "body": "Model overloaded",
            "done": true, "error": true
        });
        ws.send(Message::Text(error.to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session = session(&url).await;
    let reply = session.ask("Hi?", |_| {}).await.unwrap();
    assert!(!reply.is_complete());
    assert!(reply.error.unwrap().contains("Model overloaded"));
    assert_eq!(session.store().count().unwrap(), 1);
}

#[tokio::test]
async fn in_flight_reply_is_resumed_on_start() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        next_of_kind(&mut ws, "resume_request").await;
        ws.send(Message::Text(
            r#"{"type":"stream_resuming","id":"turn-9"}"#.into(),
        ))
        .await
        .unwrap();
        let ack = next_of_kind(&mut ws, "resume_ack").await;
        assert_eq!(ack["id"], "turn-9");
        let replay = serde_json::json!({
            "type": "response_chunk", "id": "turn-9", "body": "Once upon",
            "done": false, "replay": true
        });
        ws.send(Message::Text(replay.to_string())).await.unwrap();
        ws.send(chunk("turn-9", " a time", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session = session(&url).await;
    let mut replays = Vec::new();
    let reply = session
        .resume_pending(|c| replays.push(c.replay))
        .await
        .unwrap()
        .expect("a reply should be resumed");
    assert_eq!(reply.answer, "Once upon a time");
    assert_eq!(replays, vec![true, false]);
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].role, Role::Assistant);
}

#[tokio::test]
async fn reply_announced_on_connect_is_resumed() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ws.send(Message::Text(
            r#"{"type":"stream_resuming","id":"turn-4"}"#.into(),
        ))
        .await
        .unwrap();
        let ack = next_of_kind(&mut ws, "resume_ack").await;
        assert_eq!(ack["id"], "turn-4");
        ws.send(chunk("turn-4", "Welcome back", true)).await.unwrap();
        while next_json(&mut ws).await.is_some() {}
    });

    let mut session = session(&url).await;
    let reply = session
        .resume_pending(|_| {})
        .await
        .unwrap()
        .expect("announced reply should be resumed");
    assert_eq!(reply.answer, "Welcome back");
    assert_eq!(session.store().count().unwrap(), 1);
}

#[tokio::test]
async fn nothing_to_resume_resolves_empty() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while next_json(&mut ws).await.is_some() {}
    });

    let mut session = session(&url).await;
    let resumed = session.resume_pending(|_| {}).await.unwrap();
    assert!(resumed.is_none());
    assert_eq!(session.store().count().unwrap(), 0);
}

#[tokio::test]
async fn dropped_connection_resumes_same_stream() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let request = next_of_kind(&mut first, "send_request").await;
        let id = request["id"].as_str().unwrap().to_string();
        first.send(chunk(&id, "part one, ", false)).await.unwrap();
        first.close(None).await.unwrap();

        let mut second = accept(&listener).await;
        next_of_kind(&mut second, "resume_request").await;
        second
            .send(Message::Text(
                serde_json::json!({"type": "stream_resuming", "id": id}).to_string(),
            ))
            .await
            .unwrap();
        next_of_kind(&mut second, "resume_ack").await;
        second.send(chunk(&id, "part two", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session = session(&url).await;
    let reply = tokio::time::timeout(Duration::from_secs(10), session.ask("Long one", |_| {}))
        .await
        .expect("turn should finish")
        .unwrap();
    assert!(reply.is_complete());
    assert_eq!(reply.answer, "part one, part two");
    assert_eq!(session.store().count().unwrap(), 2);
}

#[tokio::test]
async fn cancel_handle_stops_turn_and_notifies_server() {
    let (listener, url) = listen().await;
    let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_of_kind(&mut ws, "send_request").await;
        let id = request["id"].as_str().unwrap().to_string();
        ws.send(chunk(&id, "partial", false)).await.unwrap();
        let cancel = next_of_kind(&mut ws, "cancel").await;
        cancel_tx.send((id, cancel)).unwrap();
    });

    let mut session = session(&url).await;
    let handle = session.cancel_handle();
    assert!(!handle.cancel());
    let reply = session
        .ask("Write a novel", |_| {
            handle.cancel();
        })
        .await
        .unwrap();
    assert!(reply.cancelled);
    assert_eq!(reply.answer, "partial");

    let (id, cancel) = cancel_rx.recv().await.unwrap();
    assert_eq!(cancel["id"], id.as_str());
    assert!(!handle.cancel());
}

#[tokio::test]
async fn transcript_survives_reopen() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        loop {
            let mut ws = accept(&listener).await;
            tokio::spawn(async move {
                while let Some(frame) = next_json(&mut ws).await {
                    if frame["type"] == "send_request" {
                        let id = frame["id"].as_str().unwrap().to_string();
                        ws.send(chunk(&id, "Sure", true)).await.unwrap();
                    }
                }
            });
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("transcript.db");
    let mut cfg = config(&url);
    cfg.store.path = Some(db.to_str().unwrap().to_string());

    let mut session = ChatSession::open(cfg.clone()).await.unwrap();
    session.ask("One", |_| {}).await.unwrap();
    let ids: Vec<_> = session.messages().iter().map(|m| m.id.clone()).collect();
    drop(session);

    let mut reopened = ChatSession::open(cfg).await.unwrap();
    let reloaded: Vec<_> = reopened.messages().iter().map(|m| m.id.clone()).collect();
    assert_eq!(reloaded, ids);

    reopened.ask("Two", |_| {}).await.unwrap();
    let texts: Vec<_> = reopened.store().load().unwrap().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["One", "Sure", "Two", "Sure"]);
}
