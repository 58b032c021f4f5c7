#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_domain::{User, UserId};
use parley_util::secret::SecretString;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::server::auth::{UpgradeAuth, issue_hmac_token};
use crate::server::connection::{CLOSE_UNKNOWN_USER, ConnectionContext, ConnectionSettings};
use crate::server::dispatcher::{DispatchSettings, Dispatcher};
use crate::server::keepalive::KeepaliveSettings;
use crate::server::listener::serve;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::store::MemoryStore;

const SECRET: &str = "smoke-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
	addr: SocketAddr,
	hub: RoomHub,
	store: Arc<MemoryStore>,
}

async fn start(settings: ConnectionSettings) -> Server {
	let store = Arc::new(MemoryStore::new());
	let hub = RoomHub::spawn(RoomHubConfig::default());
	let dispatcher = Arc::new(Dispatcher::new(store.clone(), hub.clone(), DispatchSettings::default()));

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	let ctx = ConnectionContext {
		hub: hub.clone(),
		dispatcher,
		settings: Arc::new(settings),
	};
	tokio::spawn(serve(listener, ctx, std::future::pending::<()>()));

	Server { addr, hub, store }
}

fn secured() -> ConnectionSettings {
	ConnectionSettings {
		auth: UpgradeAuth {
			hmac_secret: Some(SecretString::new(SECRET)),
			allow_insecure_user_id: false,
		},
		upgrade_path: Some("/ws".into()),
		..ConnectionSettings::default()
	}
}

fn url(server: &Server, user_id: UserId) -> String {
	let token = issue_hmac_token(user_id, 60, SECRET).expect("token");
	format!("ws://{}/ws?token={token}", server.addr)
}

async fn connect(server: &Server, user: &User) -> Ws {
	let (ws, _resp) = connect_async(url(server, user.id)).await.expect("connect");
	ws
}

async fn send(ws: &mut Ws, json: String) {
	ws.send(Message::Text(json.into())).await.expect("send");
}

/// Next text envelope, skipping control frames.
async fn next_envelope(ws: &mut Ws) -> Value {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("envelope within timeout")
			.expect("stream open")
			.expect("read ok");
		if let Message::Text(text) = msg {
			return serde_json::from_str(text.as_str()).expect("json envelope");
		}
	}
}

async fn wait_for_connections(hub: &RoomHub, n: usize) {
	for _ in 0..100 {
		if hub.snapshot().await.map(|s| s.connections) == Some(n) {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("hub never reached {n} live connections");
}

#[tokio::test]
async fn chat_and_invite_over_real_websockets() {
	let server = start(secured()).await;
	let alice = server.store.insert_user("alice", "0001").await.expect("alice");
	let bob = server.store.insert_user("bob", "1234").await.expect("bob");
	let room = server.store.insert_room("general", alice.id).await.expect("room");

	let mut a = connect(&server, &alice).await;
	let mut b = connect(&server, &bob).await;
	wait_for_connections(&server.hub, 2).await;

	send(&mut a, format!(r#"{{"type":"join_room","payload":"{}"}}"#, room.id)).await;
	send(
		&mut a,
		format!(r#"{{"type":"invite_users","payload":{{"room_id":{},"username":"bob","tag":"1234"}}}}"#, room.id),
	)
	.await;

	let received = next_envelope(&mut b).await;
	assert_eq!(received["type"], "invite_received");
	assert_eq!(received["payload"]["sender"], "alice");
	let sent = next_envelope(&mut a).await;
	assert_eq!(sent["type"], "invite_sent");
	assert_eq!(sent["payload"]["receiver_id"], bob.id.get());

	send(&mut b, format!(r#"{{"type":"accept_invite","payload":"{}"}}"#, room.id)).await;
	assert_eq!(next_envelope(&mut a).await["type"], "user_joined");
	let joined = next_envelope(&mut b).await;
	assert_eq!(joined["type"], "room_joined");
	assert_eq!(joined["payload"]["id"], room.id.get());

	send(
		&mut b,
		format!(r#"{{"type":"message","payload":{{"room_id":{},"content":"hello alice"}}}}"#, room.id),
	)
	.await;
	for ws in [&mut a, &mut b] {
		let msg = next_envelope(ws).await;
		assert_eq!(msg["type"], "message");
		assert_eq!(msg["payload"]["content"], "hello alice");
		assert_eq!(msg["payload"]["user"]["username"], "bob");
	}

	b.close(None).await.expect("close");
	wait_for_connections(&server.hub, 1).await;
}

#[tokio::test]
async fn malformed_frame_does_not_end_the_session() {
	let server = start(secured()).await;
	let alice = server.store.insert_user("alice", "0001").await.expect("alice");
	let room = server.store.insert_room("general", alice.id).await.expect("room");
	let mut a = connect(&server, &alice).await;

	send(&mut a, "definitely not json".to_string()).await;
	send(&mut a, r#"{"type":"teleport","payload":"7"}"#.to_string()).await;
	send(&mut a, format!(r#"{{"type":"join_room","payload":"{}"}}"#, room.id)).await;
	send(
		&mut a,
		format!(r#"{{"type":"message","payload":{{"room_id":{},"content":"still alive"}}}}"#, room.id),
	)
	.await;

	let msg = next_envelope(&mut a).await;
	assert_eq!(msg["type"], "message");
	assert_eq!(msg["payload"]["content"], "still alive");
}

#[tokio::test]
async fn bad_token_is_refused_at_upgrade() {
	let server = start(secured()).await;

	let forged = format!("ws://{}/ws?token=v1.e30.AAAA", server.addr);
	match connect_async(forged).await {
		Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
		other => panic!("expected 401, got {other:?}"),
	}

	let missing = format!("ws://{}/ws", server.addr);
	assert!(connect_async(missing).await.is_err());

	let wrong_path = format!("ws://{}/elsewhere", server.addr);
	match connect_async(wrong_path).await {
		Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), 404),
		other => panic!("expected 404, got {other:?}"),
	}

	let snapshot = server.hub.snapshot().await.expect("hub running");
	assert_eq!(snapshot.connections, 0);
}

#[tokio::test]
async fn unknown_user_is_closed_with_4004() {
	let server = start(secured()).await;
	let ghost = UserId::new(404).expect("id");

	let (mut ws, _resp) = connect_async(url(&server, ghost)).await.expect("upgrade succeeds");
	let msg = timeout(Duration::from_secs(2), ws.next())
		.await
		.expect("close within timeout")
		.expect("stream open")
		.expect("read ok");
	match msg {
		Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Library(CLOSE_UNKNOWN_USER)),
		other => panic!("expected close frame, got {other:?}"),
	}
}

#[tokio::test]
async fn insecure_user_id_only_when_enabled() {
	let server = start(ConnectionSettings {
		auth: UpgradeAuth {
			hmac_secret: None,
			allow_insecure_user_id: true,
		},
		..ConnectionSettings::default()
	})
	.await;
	let alice = server.store.insert_user("alice", "0001").await.expect("alice");

	let (_ws, _resp) = connect_async(format!("ws://{}/?user_id={}", server.addr, alice.id))
		.await
		.expect("dev upgrade");
	wait_for_connections(&server.hub, 1).await;

	let locked = start(ConnectionSettings::default()).await;
	let refused = connect_async(format!("ws://{}/?user_id={}", locked.addr, alice.id)).await;
	assert!(refused.is_err());
}

#[tokio::test]
async fn silent_peer_is_dropped_once_the_read_deadline_passes() {
	let server = start(ConnectionSettings {
		keepalive: KeepaliveSettings {
			pong_wait: Duration::from_millis(300),
			write_wait: Duration::from_millis(300),
		},
		..secured()
	})
	.await;
	let alice = server.store.insert_user("alice", "0001").await.expect("alice");
	let room = server.store.insert_room("general", alice.id).await.expect("room");

	// never read from, so pings go unanswered
	let mut ws = connect(&server, &alice).await;
	send(&mut ws, format!(r#"{{"type":"join_room","payload":"{}"}}"#, room.id)).await;
	wait_for_connections(&server.hub, 1).await;

	tokio::time::sleep(Duration::from_millis(450)).await;
	wait_for_connections(&server.hub, 0).await;

	let snapshot = server.hub.snapshot().await.expect("hub running");
	assert!(snapshot.rooms.is_empty());
	drop(ws);
}
