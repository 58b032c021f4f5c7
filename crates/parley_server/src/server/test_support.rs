#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{ConnId, Room, User};
use parley_protocol::Frame;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::server::dispatcher::{DispatchSettings, Dispatcher, Session};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::state::ConnectionHandle;
use crate::store::{ChatStore, MemoryStore};

/// A registered connection without a socket: the test reads its outbound queue directly.
pub struct Client {
	pub session: Session,
	rx: mpsc::Receiver<Frame>,
	_shutdown: CancellationToken,
}

impl Client {
	/// Next outbound envelope as JSON.
	pub async fn next(&mut self) -> Value {
		let frame = timeout(Duration::from_millis(500), self.rx.recv())
			.await
			.expect("expected an envelope within timeout")
			.expect("outbound queue open");
		serde_json::from_slice(frame.as_bytes()).expect("outbound frame is json")
	}

	/// Next envelope, asserting its type.
	pub async fn expect(&mut self, kind: &str) -> Value {
		let env = self.next().await;
		assert_eq!(env["type"], kind, "unexpected envelope: {env}");
		env["payload"].clone()
	}

	pub async fn assert_silent(&mut self) {
		let got = timeout(Duration::from_millis(50), self.rx.recv()).await;
		if let Ok(Some(frame)) = got {
			panic!("{} unexpectedly received {}", self.session.conn_id, frame.as_str());
		}
	}
}

pub struct Harness {
	pub memory: Arc<MemoryStore>,
	pub hub: RoomHub,
	pub dispatcher: Dispatcher,
	next_conn: u64,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_store(Arc::new(MemoryStore::new()), None)
	}

	/// `store` overrides the store the dispatcher talks to; `memory` is still used for seeding.
	pub fn with_store(memory: Arc<MemoryStore>, store: Option<Arc<dyn ChatStore>>) -> Self {
		let hub = RoomHub::spawn(RoomHubConfig {
			command_channel_capacity: 256,
			debug_logs: false,
		});
		let store = store.unwrap_or_else(|| memory.clone() as Arc<dyn ChatStore>);
		let dispatcher = Dispatcher::new(store, hub.clone(), DispatchSettings::default());
		Self {
			memory,
			hub,
			dispatcher,
			next_conn: 1,
		}
	}

	pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
		self.dispatcher = Dispatcher::new(self.dispatcher.store().clone(), self.hub.clone(), settings);
		self
	}

	pub async fn user(&self, username: &str, tag: &str) -> User {
		self.memory.insert_user(username, tag).await.expect("insert user")
	}

	pub async fn room(&self, name: &str, owner: &User) -> Room {
		self.memory.insert_room(name, owner.id).await.expect("insert room")
	}

	pub async fn connect(&mut self, user: &User) -> Client {
		let conn_id = ConnId(self.next_conn);
		self.next_conn += 1;

		let (tx, rx) = mpsc::channel(64);
		let shutdown = CancellationToken::new();
		self.hub
			.register(ConnectionHandle::new(conn_id, user.id, tx, shutdown.clone()))
			.await;

		Client {
			session: Session::new(conn_id, user),
			rx,
			_shutdown: shutdown,
		}
	}

	/// Dispatch a raw JSON envelope as if it arrived on `client`'s socket.
	pub async fn send(&self, client: &mut Client, json: &str) {
		let envelope = parley_protocol::decode_envelope_default(json.as_bytes()).expect("valid inbound envelope");
		self.dispatcher.dispatch(&mut client.session, envelope).await;
	}
}
