use std::time::Duration;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at},
};

use crate::{
    AppState,
    broker::{BrokerError, BrokerHandle, ConnId},
    config::HeartbeatConfig,
    events::{ClientEvent, SendMessage, ServerEvent},
};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "userId")]
    user_id: String,
}

#[derive(Debug, Error)]
enum InboundError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// `GET /ws?userId=<external id>`: one forum chat connection.
#[debug_handler(state = AppState)]
pub async fn forum_ws(
    Query(ConnectQuery { user_id }): Query<ConnectQuery>,
    State(broker): State<BrokerHandle>,
    State(heartbeat): State<HeartbeatConfig>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker, heartbeat, user_id))
}

async fn handle_socket(socket: WebSocket, broker: BrokerHandle, heartbeat: HeartbeatConfig, user_id: String) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let conn = match broker.connect(user_id, conn_tx).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(error = %err, "dropping websocket");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let mut last_heartbeat = Instant::now();
    let mut ticks = interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        tracing::warn!(%conn, error = %err, "websocket transport error");
                        break;
                    }
                    None => break,
                };
                last_heartbeat = Instant::now();

                let outcome = match &frame {
                    Message::Text(text) => dispatch(&broker, conn, text.as_str()),
                    Message::Binary(bytes) => match std::str::from_utf8(bytes) {
                        Ok(text) => dispatch(&broker, conn, text),
                        Err(err) => {
                            tracing::debug!(%conn, error = %err, "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => break,
                };

                match outcome {
                    Ok(()) => {}
                    Err(InboundError::Malformed(err)) => {
                        tracing::debug!(%conn, error = %err, "malformed client event");
                        let reply = ServerEvent::error(format!("malformed event: {err}"));
                        if let Err(err) = send_event(&mut sender, &reply, heartbeat.timeout).await {
                            tracing::debug!(%conn, error = %err, "failed to push event");
                            break;
                        }
                    }
                    Err(InboundError::Broker(err)) => {
                        tracing::error!(%conn, error = %err, "closing websocket");
                        break;
                    }
                }
            }

            event = conn_rx.recv() => {
                // the broker only drops our sender once it has forgotten us
                let Some(event) = event else { break };
                if let Err(err) = send_event(&mut sender, &event, heartbeat.timeout).await {
                    tracing::warn!(%conn, error = %err, "client stopped reading; disconnecting");
                    break;
                }
            }

            _ = ticks.tick() => {
                if last_heartbeat.elapsed() > heartbeat.timeout {
                    tracing::warn!(%conn, timeout = ?heartbeat.timeout, "client missed its heartbeat; disconnecting");
                    break;
                }
                if send_frame(&mut sender, Message::Ping(Bytes::new()), heartbeat.timeout).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = broker.disconnect(conn);
    let _ = tokio::time::timeout(heartbeat.timeout, sender.close()).await;
}

fn dispatch(broker: &BrokerHandle, conn: ConnId, frame: &str) -> Result<(), InboundError> {
    match serde_json::from_str(frame)? {
        ClientEvent::JoinRoom(room) => broker.join(conn, room)?,
        ClientEvent::LeaveRoom(room) => broker.leave(conn, room)?,
        ClientEvent::SendMessage(SendMessage { room_id, text }) => broker.send_message(conn, room_id, text)?,
    }
    Ok(())
}

/// Writes one frame. A client that has not taken it within `limit` has
/// stopped reading and the write fails.
async fn send_frame<S>(sender: &mut S, frame: Message, limit: Duration) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    tokio::time::timeout(limit, sender.send(frame))
        .await
        .map_err(axum::Error::new)?
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent, limit: Duration) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    send_frame(sender, Message::Text(json.into()), limit).await
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, net::SocketAddr, sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message as ClientFrame};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        broker::Broker,
        db,
        history::SqliteHistoryStore,
        identity::{SqliteIdentityResolver, UserRecord},
        models::{Author, ChatMessage},
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const JOIN_FORUM_42: &str = r#"{"event":"joinRoom","data":"forum-42"}"#;

    async fn start() -> (BrokerHandle, Arc<SqliteHistoryStore>) {
        let db_pool = db::memory_pool().await;
        db::insert_user(&db_pool, &UserRecord::new("u-alice", "alice", "alice@x.com").with_name("Alice", "Smith"))
            .await
            .unwrap();
        let history = Arc::new(SqliteHistoryStore::new(db_pool.clone()));
        let (broker, handle) = Broker::new(Arc::new(SqliteIdentityResolver::new(db_pool)), history.clone());
        tokio::spawn(broker.run());
        (handle, history)
    }

    #[tokio::test]
    async fn dispatches_membership_events() {
        let (broker, _) = start().await;
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let conn = broker.connect("alice", conn_tx).await.unwrap();

        dispatch(&broker, conn, r#"{"event":"joinRoom","data":"forum-42"}"#).unwrap();
        dispatch(&broker, conn, r#"{"event":"joinRoom","data":"forum-7"}"#).unwrap();
        dispatch(&broker, conn, r#"{"event":"leaveRoom","data":"forum-7"}"#).unwrap();

        assert_eq!(
            broker.rooms(conn).await.unwrap(),
            Some(BTreeSet::from(["forum-42".to_owned()]))
        );
    }

    #[tokio::test]
    async fn dispatches_messages_using_forum_id() {
        let (broker, _) = start().await;
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let conn = broker.connect("alice", conn_tx).await.unwrap();
        dispatch(&broker, conn, r#"{"event":"joinRoom","data":"forum-42"}"#).unwrap();

        dispatch(
            &broker,
            conn,
            r#"{"event":"sendMessage","data":{"forumId":"forum-42","text":"hello"}}"#,
        )
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::Message(message) => {
                assert_eq!(message.text, "hello");
                assert_eq!(message.author.name, "Alice Smith");
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_reported() {
        let (broker, _) = start().await;
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let conn = broker.connect("alice", conn_tx).await.unwrap();

        assert!(matches!(dispatch(&broker, conn, "not json"), Err(InboundError::Malformed(_))));
        assert!(matches!(
            dispatch(&broker, conn, r#"{"event":"sendMessage","data":"forum-42"}"#),
            Err(InboundError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn stopped_broker_ends_dispatch() {
        let (broker, _) = start().await;
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        let conn = broker.connect("alice", conn_tx).await.unwrap();
        broker.shutdown();
        // wait for the broker task to drop its receiver
        while broker.members("forum-42").await.is_ok() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            dispatch(&broker, conn, r#"{"event":"joinRoom","data":"forum-42"}"#),
            Err(InboundError::Broker(BrokerError::Closed))
        ));
    }

    #[tokio::test]
    async fn connecting_requires_a_user_id() {
        let (broker, history) = start().await;
        let app = crate::app(
            AppState {
                broker,
                history,
                heartbeat: HeartbeatConfig::default(),
            },
            &[],
        );

        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn serve(heartbeat: HeartbeatConfig) -> (SocketAddr, BrokerHandle) {
        let (broker, history) = start().await;
        let app = crate::app(
            AppState {
                broker: broker.clone(),
                history,
                heartbeat,
            },
            &[],
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, broker)
    }

    async fn open(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?userId=alice"))
            .await
            .unwrap();
        client
    }

    async fn wait_for_members(broker: &BrokerHandle, room: &str, len: usize, within: Duration) {
        tokio::time::timeout(within, async {
            while broker.members(room).await.unwrap().len() != len {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{room} never had {len} members"));
    }

    async fn next_event(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for an event")
                .expect("socket closed")
                .unwrap();
            if let ClientFrame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_an_error_reply_and_the_socket_stays_open() {
        let (addr, broker) = serve(HeartbeatConfig::default()).await;
        let mut client = open(addr).await;

        client.send(ClientFrame::text("not json")).await.unwrap();
        let reply = next_event(&mut client).await;

        assert_eq!(reply["event"], "error");
        assert!(reply["data"]["message"].as_str().unwrap().starts_with("malformed event"));

        client.send(ClientFrame::text(JOIN_FORUM_42)).await.unwrap();
        wait_for_members(&broker, "forum-42", 1, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn binary_utf8_frames_are_events() {
        let (addr, broker) = serve(HeartbeatConfig::default()).await;
        let mut client = open(addr).await;

        client.send(ClientFrame::binary(JOIN_FORUM_42.as_bytes().to_vec())).await.unwrap();
        wait_for_members(&broker, "forum-42", 1, Duration::from_secs(2)).await;

        let send = r#"{"event":"sendMessage","data":{"forumId":"forum-42","text":"hi"}}"#;
        client.send(ClientFrame::binary(send.as_bytes().to_vec())).await.unwrap();
        let event = next_event(&mut client).await;

        assert_eq!(event["event"], "message");
        assert_eq!(event["data"]["text"], "hi");
        assert_eq!(event["data"]["author"]["name"], "Alice Smith");
    }

    #[tokio::test]
    async fn closing_the_socket_leaves_every_room() {
        let (addr, broker) = serve(HeartbeatConfig::default()).await;
        let mut client = open(addr).await;
        client.send(ClientFrame::text(JOIN_FORUM_42)).await.unwrap();
        wait_for_members(&broker, "forum-42", 1, Duration::from_secs(2)).await;

        client.close(None).await.unwrap();

        wait_for_members(&broker, "forum-42", 0, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn silent_client_is_disconnected_after_the_timeout() {
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        };
        let (addr, broker) = serve(heartbeat).await;
        let mut client = open(addr).await;
        client.send(ClientFrame::text(JOIN_FORUM_42)).await.unwrap();
        wait_for_members(&broker, "forum-42", 1, Duration::from_secs(2)).await;

        // never polled again, so no pongs go out
        wait_for_members(&broker, "forum-42", 0, Duration::from_secs(3)).await;
        drop(client);
    }

    #[tokio::test]
    async fn client_that_stops_reading_is_disconnected() {
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        };
        let (addr, broker) = serve(heartbeat).await;
        let mut client = open(addr).await;
        client.send(ClientFrame::text(JOIN_FORUM_42)).await.unwrap();
        wait_for_members(&broker, "forum-42", 1, Duration::from_secs(2)).await;

        // far more than the socket buffers hold
        let bulk = "x".repeat(1 << 20);
        for _ in 0..64 {
            broker
                .publish(ChatMessage::new("forum-42", bulk.clone(), Author::anonymous()))
                .unwrap();
        }

        wait_for_members(&broker, "forum-42", 0, Duration::from_secs(5)).await;
        drop(client);
    }
}
