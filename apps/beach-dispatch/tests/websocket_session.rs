//! A real agent socket over TCP against a served router.

use std::net::SocketAddr;
use std::time::Duration;

use beach_dispatch::auth::AuthConfig;
use beach_dispatch::routes::build_router;
use beach_dispatch::state::{AppState, ServiceSettings};
use beach_dispatch::store::MemoryStore;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (AppState, SocketAddr) {
    let state = AppState::new(
        MemoryStore::new(),
        &ServiceSettings::default(),
        AuthConfig {
            jwt_secret: None,
            bypass: true,
        },
        "ws-test",
    );
    state.fanout.start().await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, addr)
}

async fn recv_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn agent_registers_and_serves_a_batch() {
    let (state, addr) = serve().await;
    let user = beach_dispatch::ids::UserId::parse("u1").unwrap();
    let code = state.pairing.issue_or_refresh(&user).await.unwrap();

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let hello = recv_json(&mut socket).await;
    assert_eq!(hello["type"], "connected");
    assert!(hello["connectionToken"].is_string());

    send_json(&mut socket, json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut socket).await["type"], "pong");

    socket
        .send(Message::Binary(
            json!({"type": "register", "deviceId": "d1", "connectionCode": code.code})
                .to_string()
                .into_bytes(),
        ))
        .await
        .unwrap();
    assert_eq!(
        recv_json(&mut socket).await,
        json!({"type": "registered", "success": true})
    );

    let dispatcher = state.dispatcher.clone();
    let request_user = user.clone();
    let request = tokio::spawn(async move {
        dispatcher
            .dispatch(&request_user, None, vec!["uptime".into()])
            .await
    });

    let execute = recv_json(&mut socket).await;
    assert_eq!(execute["type"], "execute");
    assert_eq!(execute["commands"], json!(["uptime"]));
    send_json(
        &mut socket,
        json!({
            "type": "command_result",
            "commandId": execute["batchId"],
            "index": 0,
            "output": "up 1 day",
            "success": true,
        }),
    )
    .await;

    let outcome = request.await.unwrap().unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].output, json!("up 1 day"));

    socket.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.registry.is_connected(&user).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device slot was not released on close");
    assert_eq!(state.fanout.local_connections(), 0);
}
