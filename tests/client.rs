#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;

use resilient_ws::client::{Client, ClientError};
use resilient_ws::error::HandlerError;
use resilient_ws::log::NoopLogger;
use resilient_ws::router::{Context, DispatchErrorCause, schema};
use resilient_ws::ws::ConnectionEvent;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Notify, broadcast};
use tokio::time::timeout;

use crate::common::{Behavior, MockTransport, WAIT, collect_until, config};

#[derive(Debug, Deserialize)]
struct Ping {
    id: u64,
}

fn client(transport: &MockTransport) -> Client {
    Client::with_transport(
        config(&["ws://a.test/"], 3, 1),
        transport.clone(),
        Arc::new(NoopLogger::default()),
    )
    .unwrap()
}

async fn next_error(errors: &mut broadcast::Receiver<ClientError>) -> ClientError {
    timeout(WAIT, errors.recv()).await.unwrap().unwrap()
}

async fn open(client: &Client) {
    let mut events = client.connection().subscribe();
    client.connect();
    collect_until(&mut events, |event| {
        matches!(event, ConnectionEvent::Opened { .. })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn routes_messages_and_replies_over_the_connection() {
    let transport = MockTransport::always(Behavior::Accept);
    let client = client(&transport);
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    client.register(
        schema::tagged::<Ping>("type", "ping"),
        move |ctx: Context<Ping>| {
            let seen_tx = seen_tx.clone();
            async move {
                let id = ctx.value.id;
                ctx.send_json(&json!({ "type": "pong", "id": id })).await?;
                seen_tx.send(ctx.connection.message_count).unwrap();
                Ok::<_, HandlerError>(())
            }
        },
    );

    open(&client).await;
    assert!(transport.latest().message(r#"{"type":"ping","id":3}"#));

    timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let reply: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
    assert_eq!(reply, json!({ "type": "pong", "id": 3 }));
}

#[derive(Debug, Deserialize)]
struct Exchange {}

#[tokio::test(start_paused = true)]
async fn handler_can_wait_on_a_later_message() {
    let transport = MockTransport::always(Behavior::Accept);
    let client = client(&transport);
    let reply_arrived = Arc::new(Notify::new());
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let waiting = Arc::clone(&reply_arrived);
    client.register(
        schema::tagged::<Exchange>("type", "request"),
        move |ctx: Context<Exchange>| {
            let waiting = Arc::clone(&waiting);
            let done_tx = done_tx.clone();
            async move {
                waiting.notified().await;
                done_tx.send(ctx.connection.message_count).unwrap();
                Ok::<_, HandlerError>(())
            }
        },
    );
    let arrived = Arc::clone(&reply_arrived);
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    client.register(
        schema::tagged::<Exchange>("type", "response"),
        move |ctx: Context<Exchange>| {
            let arrived = Arc::clone(&arrived);
            let reply_tx = reply_tx.clone();
            async move {
                reply_tx.send(ctx.connection.message_count).unwrap();
                arrived.notify_one();
                Ok::<_, HandlerError>(())
            }
        },
    );

    open(&client).await;
    let remote = transport.latest();
    assert!(remote.message(r#"{"type":"request"}"#));
    assert!(remote.message(r#"{"type":"response"}"#));

    // Each handler sees the state as of its own payload.
    assert_eq!(timeout(WAIT, reply_rx.recv()).await.unwrap(), Some(2));
    assert_eq!(timeout(WAIT, done_rx.recv()).await.unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn unifies_connection_and_dispatch_errors() {
    let transport = MockTransport::always(Behavior::Accept);
    let client = client(&transport);
    client.register(
        schema::tagged::<Ping>("type", "ping"),
        |_ctx: Context<Ping>| async { Err::<(), HandlerError>("not today".into()) },
    );
    let mut errors = client.errors();

    open(&client).await;
    let remote = transport.latest();

    assert!(remote.error("read timeout"));
    let ClientError::Connection(error) = next_error(&mut errors).await else {
        panic!("expected a connection error");
    };
    assert_eq!(error, "read timeout");

    assert!(remote.message("definitely not json"));
    let ClientError::Dispatch(error) = next_error(&mut errors).await else {
        panic!("expected a dispatch error");
    };
    assert_eq!(error.cause, DispatchErrorCause::DecodeFailure);

    assert!(remote.message(r#"{"type":"ping","id":1}"#));
    let ClientError::Dispatch(error) = next_error(&mut errors).await else {
        panic!("expected a dispatch error");
    };
    assert_eq!(error.cause, DispatchErrorCause::HandlerFailure);
    assert_eq!(error.registration, Some(0));
}

#[tokio::test(start_paused = true)]
async fn send_helpers_follow_connection_state() {
    let transport = MockTransport::always(Behavior::Accept);
    let client = client(&transport);

    assert!(!client.send("early").await);

    open(&client).await;
    assert!(client.send_json(&json!({ "op": "subscribe" })).await.unwrap());
    assert!(client.snapshot().is_connected());

    client.update_params([("token", "abc")]);
    let mut events = client.connection().subscribe();
    collect_until(&mut events, |event| {
        matches!(event, ConnectionEvent::Opened { .. })
    })
    .await;
    assert_eq!(client.snapshot().endpoint.as_str(), "ws://a.test/?token=abc");

    assert_eq!(
        transport.sent(),
        vec![br#"{"op":"subscribe"}"#.to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_the_client_releases_the_session() {
    let transport = MockTransport::always(Behavior::Accept);
    let client = client(&transport);

    open(&client).await;
    assert_eq!(transport.live_sessions(), 1);

    drop(client);

    timeout(WAIT, async {
        while transport.live_sessions() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
