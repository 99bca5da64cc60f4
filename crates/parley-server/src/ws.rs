//! WebSocket endpoint.
//!
//! Connection lifecycle: the upgrade is authenticated first, then the socket
//! is registered under its username (replacing any earlier connection for
//! that user), and finally torn down on close, read error or undecodable
//! frame. Each connection runs three tasks: the reader (this handler), a
//! mailbox worker that dispatches inbound events, and a writer that is the
//! only task touching the socket sink.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::Stream, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::protocol::{encode_message, ChatEvent};

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::dispatcher::spawn_mailbox;
use crate::error::ServerError;
use crate::registry::ConnectionHandle;

/// How long teardown waits for the writer to flush and send its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    Closed,
    ReadError,
    Undecodable,
    Binary,
    MailboxClosed,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let token = params
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .map(str::to_string);

    let username = match token {
        Some(token) => state.sessions.resolve(&token).await,
        None => None,
    };

    match username {
        Some(username) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, username))
            .into_response(),
        None => ServerError::Unauthenticated.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, username: String) {
    let (mut sink, stream) = socket.split();
    let (handle, mut outbound) =
        ConnectionHandle::new(username.clone(), state.config.outbound_queue_capacity);
    let conn_id = handle.id();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match encode_message(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(id = message.id, error = %e, "Failed to encode outbound message");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    state.registry.register(handle).await;
    set_online(&state, &username, true).await;
    info!(user = %username, conn = %conn_id, "WebSocket connected");

    let (mailbox, worker) = spawn_mailbox(
        state.dispatcher.clone(),
        username.clone(),
        state.config.mailbox_capacity,
    );

    let end = read_frames(stream, &mailbox, &username).await;

    drop(mailbox);
    worker.stop().await;

    // Removing our handle closes the outbound queue, so the writer finishes.
    if state.registry.deregister(&username, conn_id).await {
        set_online(&state, &username, false).await;
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(user = %username, conn = %conn_id, reason = ?end, "WebSocket disconnected");
}

/// Decode inbound frames into the mailbox until the connection ends.
///
/// Waits on the mailbox when it is full, so a slow worker stops the reader
/// from pulling more frames off the socket.
async fn read_frames<S>(
    mut stream: S,
    mailbox: &mpsc::Sender<ChatEvent>,
    username: &str,
) -> ReadEnd
where
    S: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match ChatEvent::from_json(&text) {
                Ok(event) => {
                    if mailbox.send(event).await.is_err() {
                        return ReadEnd::MailboxClosed;
                    }
                }
                Err(e) => {
                    warn!(user = %username, error = %e, "Undecodable frame, closing connection");
                    return ReadEnd::Undecodable;
                }
            },
            Ok(WsMessage::Binary(_)) => {
                warn!(user = %username, "Binary frame, closing connection");
                return ReadEnd::Binary;
            }
            Ok(WsMessage::Close(_)) => return ReadEnd::Closed,
            Ok(_) => {}
            Err(e) => {
                debug!(user = %username, error = %e, "Socket read error");
                return ReadEnd::ReadError;
            }
        }
    }
    ReadEnd::Closed
}

async fn set_online(state: &AppState, username: &str, online: bool) {
    state.presence.set_online(username, online).await;
    if let Err(e) = state.users.set_online(username, online).await {
        warn!(user = %username, error = %e, "Failed to persist online flag");
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use futures::stream;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::*;
    use crate::api::build_router;
    use crate::config::ServerConfig;
    use crate::webhook::tests::RecordingTransport;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn event_frame(to: &str, content: &str) -> Result<WsMessage, axum::Error> {
        let event = ChatEvent {
            to_user: to.to_string(),
            content: content.to_string(),
            ..Default::default()
        };
        Ok(WsMessage::Text(serde_json::to_string(&event).unwrap()))
    }

    async fn start_server() -> (AppState, SocketAddr, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = AppState::build(config, Arc::new(RecordingTransport::default()))
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, addr, dir)
    }

    async fn connect(state: &AppState, addr: SocketAddr, username: &str) -> Client {
        if !state.users.exists(username).await {
            state.users.register(username, "hash".into()).await.unwrap();
        }
        let token = state.sessions.issue(username).await;
        let (client, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        client
    }

    async fn wait_until<F, Fut>(state: &AppState, check: F)
    where
        F: Fn(AppState) -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check(state.clone()).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn is_online(state: &AppState, username: &str) -> bool {
        let stored = state
            .users
            .find(username)
            .await
            .is_some_and(|user| user.is_online);
        stored && state.presence.status(username).await.is_online
    }

    async fn is_offline(state: &AppState, username: &str) -> bool {
        let stored = state
            .users
            .find(username)
            .await
            .is_some_and(|user| !user.is_online);
        stored && !state.presence.status(username).await.is_online
    }

    /// Read until the server has closed the connection. Fails on any text frame.
    async fn expect_closed(client: &mut Client) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(ClientMessage::Text(text))) => panic!("unexpected frame: {text}"),
                    Some(Ok(_)) => {}
                    None | Some(Err(_)) => break,
                }
            }
        })
        .await
        .expect("connection was not closed");
    }

    async fn next_text(client: &mut Client) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(ClientMessage::Text(text))) => return text,
                    Some(Ok(_)) => {}
                    other => panic!("connection ended: {other:?}"),
                }
            }
        })
        .await
        .expect("no frame received")
    }

    #[tokio::test]
    async fn test_read_loop_stops_at_undecodable_frame() {
        let (tx, mut rx) = mpsc::channel(10);
        let frames = stream::iter(vec![
            event_frame("bob", "first"),
            Ok(WsMessage::Text("{not json".into())),
            event_frame("bob", "never read"),
        ]);

        assert_eq!(read_frames(frames, &tx, "alice").await, ReadEnd::Undecodable);
        assert_eq!(rx.try_recv().unwrap().content, "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_loop_stops_at_binary_frame() {
        let (tx, mut rx) = mpsc::channel(10);
        let frames = stream::iter(vec![
            Ok(WsMessage::Binary(vec![0, 1, 2])),
            event_frame("bob", "never read"),
        ]);

        assert_eq!(read_frames(frames, &tx, "alice").await, ReadEnd::Binary);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mailbox_blocks_reader() {
        let (tx, mut rx) = mpsc::channel(10);
        let frames: Vec<_> = (0..11).map(|i| event_frame("bob", &format!("m{i}"))).collect();

        let reader =
            tokio::spawn(async move { read_frames(stream::iter(frames), &tx, "alice").await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());

        // Freeing one slot lets the eleventh frame through.
        assert_eq!(rx.recv().await.unwrap().content, "m0");
        assert_eq!(reader.await.unwrap(), ReadEnd::Closed);

        let mut rest = Vec::new();
        while let Ok(event) = rx.try_recv() {
            rest.push(event.content);
        }
        assert_eq!(rest.len(), 10);
        assert_eq!(rest.last().map(String::as_str), Some("m10"));
    }

    #[tokio::test]
    async fn test_upgrade_requires_token() {
        let (_state, addr, _dir) = start_server().await;
        assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
        assert!(connect_async(format!("ws://{addr}/ws?token=bogus")).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_and_close_track_presence() {
        let (state, addr, _dir) = start_server().await;
        let mut alice = connect(&state, addr, "alice").await;

        wait_until(&state, |s| async move {
            s.registry.len().await == 1 && is_online(&s, "alice").await
        })
        .await;

        alice.close(None).await.unwrap();
        wait_until(&state, |s| async move {
            s.registry.len().await == 0 && is_offline(&s, "alice").await
        })
        .await;
    }

    #[tokio::test]
    async fn test_frames_reach_recipient_socket() {
        let (state, addr, _dir) = start_server().await;
        let mut alice = connect(&state, addr, "alice").await;
        let mut bob = connect(&state, addr, "bob").await;
        wait_until(&state, |s| async move { s.registry.len().await == 2 }).await;

        let event = ChatEvent {
            to_user: "bob".into(),
            content: "hello bob".into(),
            ..Default::default()
        };
        alice
            .send(ClientMessage::Text(serde_json::to_string(&event).unwrap()))
            .await
            .unwrap();

        let frame = next_text(&mut bob).await;
        let pushed: parley_shared::Message = serde_json::from_str(&frame).unwrap();
        assert_eq!(pushed.from_user, "alice");
        assert_eq!(pushed.content, "hello bob");
        assert_eq!(state.messages.history("alice", "bob").await.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_frame_closes_connection() {
        let (state, addr, _dir) = start_server().await;
        let mut alice = connect(&state, addr, "alice").await;
        wait_until(&state, |s| async move { s.registry.len().await == 1 }).await;

        alice
            .send(ClientMessage::Text("{not json".into()))
            .await
            .unwrap();

        expect_closed(&mut alice).await;
        wait_until(&state, |s| async move {
            s.registry.len().await == 0 && is_offline(&s, "alice").await
        })
        .await;
    }

    #[tokio::test]
    async fn test_binary_frame_closes_connection() {
        let (state, addr, _dir) = start_server().await;
        let mut alice = connect(&state, addr, "alice").await;
        wait_until(&state, |s| async move { s.registry.len().await == 1 }).await;

        alice
            .send(ClientMessage::Binary(vec![1, 2, 3]))
            .await
            .unwrap();

        expect_closed(&mut alice).await;
        wait_until(&state, |s| async move { s.registry.len().await == 0 }).await;
    }

    #[tokio::test]
    async fn test_replaced_connection_teardown_keeps_user_online() {
        let (state, addr, _dir) = start_server().await;
        let mut first = connect(&state, addr, "alice").await;
        wait_until(&state, |s| async move { s.registry.len().await == 1 }).await;

        let mut second = connect(&state, addr, "alice").await;

        // The replaced socket is closed by the server and tears down.
        expect_closed(&mut first).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(state.registry.len().await, 1);
        assert!(is_online(&state, "alice").await);

        // Pushes now go to the newer socket.
        state
            .dispatcher
            .dispatch(
                "bob",
                ChatEvent {
                    to_user: "alice".into(),
                    content: "still here?".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(next_text(&mut second).await.contains("still here?"));

        second.close(None).await.unwrap();
        wait_until(&state, |s| async move {
            s.registry.len().await == 0 && is_offline(&s, "alice").await
        })
        .await;
    }
}
