#![forbid(unsafe_code)]

use std::collections::HashMap;

use parley_domain::{ConnId, RoomId, UserId};
use parley_protocol::{Frame, Outbound, encode_envelope};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::state::{ConnectionHandle, Delivery, FanOut, HubState};

/// Handle to the room hub task.
///
/// Every registry mutation is a command on one channel, applied in order by a
/// single task that owns the `HubState`.
#[derive(Debug, Clone)]
pub struct RoomHub {
	tx: mpsc::Sender<HubCommand>,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued hub commands.
	pub command_channel_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			command_channel_capacity: 4096,
			debug_logs: false,
		}
	}
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubSnapshot {
	pub connections: usize,
	pub rooms: HashMap<RoomId, usize>,
}

#[derive(Debug)]
enum HubCommand {
	Register(ConnectionHandle),
	Unregister(ConnId),
	Join {
		conn_id: ConnId,
		room: RoomId,
	},
	Leave {
		conn_id: ConnId,
		room: RoomId,
	},
	Broadcast {
		room: RoomId,
		frame: Frame,
		except: Option<ConnId>,
	},
	SendTo {
		conn_id: ConnId,
		frame: Frame,
	},
	DeliverToUser {
		user_id: UserId,
		frame: Frame,
	},
	Snapshot(oneshot::Sender<HubSnapshot>),
}

impl RoomHub {
	/// Spawn the hub task. It stops once every `RoomHub` clone is dropped.
	pub fn spawn(cfg: RoomHubConfig) -> Self {
		let (tx, rx) = mpsc::channel(cfg.command_channel_capacity.max(1));
		tokio::spawn(run_hub(rx, cfg));
		Self { tx }
	}

	pub async fn register(&self, handle: ConnectionHandle) {
		self.submit(HubCommand::Register(handle)).await;
	}

	/// Idempotent.
	pub async fn unregister(&self, conn_id: ConnId) {
		self.submit(HubCommand::Unregister(conn_id)).await;
	}

	/// Idempotent.
	pub async fn join(&self, conn_id: ConnId, room: RoomId) {
		self.submit(HubCommand::Join { conn_id, room }).await;
	}

	/// Idempotent.
	pub async fn leave(&self, conn_id: ConnId, room: RoomId) {
		self.submit(HubCommand::Leave { conn_id, room }).await;
	}

	/// Enqueue a frame for every in-session member of `room`, optionally skipping one connection.
	pub async fn broadcast(&self, room: RoomId, frame: Frame, except: Option<ConnId>) {
		self.submit(HubCommand::Broadcast { room, frame, except }).await;
	}

	pub async fn send_to(&self, conn_id: ConnId, frame: Frame) {
		self.submit(HubCommand::SendTo { conn_id, frame }).await;
	}

	/// Best-effort; a user with no live connection gets nothing.
	pub async fn deliver_to_user(&self, user_id: UserId, frame: Frame) {
		self.submit(HubCommand::DeliverToUser { user_id, frame }).await;
	}

	/// Returns `None` if the hub task has stopped.
	pub async fn snapshot(&self) -> Option<HubSnapshot> {
		let (resp, rx) = oneshot::channel();
		self.submit(HubCommand::Snapshot(resp)).await;
		rx.await.ok()
	}

	pub async fn send_envelope(&self, conn_id: ConnId, envelope: &Outbound) {
		if let Some(frame) = encode_outbound(envelope) {
			self.send_to(conn_id, frame).await;
		}
	}

	pub async fn broadcast_envelope(&self, room: RoomId, envelope: &Outbound, except: Option<ConnId>) {
		if let Some(frame) = encode_outbound(envelope) {
			self.broadcast(room, frame, except).await;
		}
	}

	pub async fn deliver_envelope(&self, user_id: UserId, envelope: &Outbound) {
		if let Some(frame) = encode_outbound(envelope) {
			self.deliver_to_user(user_id, frame).await;
		}
	}

	async fn submit(&self, cmd: HubCommand) {
		if self.tx.send(cmd).await.is_err() {
			warn!("room hub: command dropped, hub task has stopped");
		}
	}
}

fn encode_outbound(envelope: &Outbound) -> Option<Frame> {
	match encode_envelope(envelope) {
		Ok(frame) => Some(frame),
		Err(e) => {
			metrics::counter!("parley_server_encode_errors_total").increment(1);
			warn!(kind = envelope.kind(), error = %e, "room hub: failed to encode envelope");
			None
		}
	}
}

async fn run_hub(mut rx: mpsc::Receiver<HubCommand>, cfg: RoomHubConfig) {
	let mut state = HubState::default();

	while let Some(cmd) = rx.recv().await {
		apply(&mut state, cmd, &cfg);
		metrics::gauge!("parley_server_active_rooms").set(state.room_count() as f64);
	}

	debug!("room hub: all handles dropped, stopping");
}

fn apply(state: &mut HubState, cmd: HubCommand, cfg: &RoomHubConfig) {
	match cmd {
		HubCommand::Register(handle) => {
			let conn_id = handle.conn_id;
			let user_id = handle.user_id;
			if !state.register(handle) {
				warn!(%conn_id, "room hub: duplicate register ignored");
			} else if cfg.debug_logs {
				debug!(%conn_id, %user_id, live = state.connection_count(), "room hub: registered");
			}
		}
		HubCommand::Unregister(conn_id) => {
			if let Some(left) = state.unregister(conn_id)
				&& cfg.debug_logs
			{
				debug!(%conn_id, rooms_left = left.len(), "room hub: unregistered");
			}
		}
		HubCommand::Join { conn_id, room } => {
			if state.join(conn_id, room) && cfg.debug_logs {
				debug!(%conn_id, room = %room, "room hub: joined");
			}
		}
		HubCommand::Leave { conn_id, room } => {
			if state.leave(conn_id, room) && cfg.debug_logs {
				debug!(%conn_id, room = %room, "room hub: left");
			}
		}
		HubCommand::Broadcast { room, frame, except } => {
			let out = state.broadcast(room, &frame, except);
			record_fan_out(&out, "broadcast");
			if cfg.debug_logs {
				debug!(room = %room, delivered = out.delivered, "room hub: broadcast");
			}
		}
		HubCommand::SendTo { conn_id, frame } => match state.send_to(conn_id, frame) {
			Delivery::Queued => {}
			Delivery::Missing => {
				if cfg.debug_logs {
					debug!(%conn_id, "room hub: direct send to unknown connection dropped");
				}
			}
			Delivery::Overflow | Delivery::Closed => record_fan_out(
				&FanOut {
					delivered: 0,
					evicted: vec![conn_id],
				},
				"direct",
			),
		},
		HubCommand::DeliverToUser { user_id, frame } => {
			let out = state.deliver_to_user(user_id, &frame);
			record_fan_out(&out, "user");
			if cfg.debug_logs && out.delivered == 0 {
				debug!(%user_id, "room hub: user not reachable, notification left pending");
			}
		}
		HubCommand::Snapshot(resp) => {
			let _ = resp.send(HubSnapshot {
				connections: state.connection_count(),
				rooms: state.room_member_counts(),
			});
		}
	}
}

fn record_fan_out(out: &FanOut, path: &'static str) {
	if out.evicted.is_empty() {
		return;
	}

	metrics::counter!("parley_server_outbound_overflow_total", "path" => path).increment(out.evicted.len() as u64);
	for conn_id in &out.evicted {
		info!(%conn_id, path, "room hub: evicted slow or closed connection");
	}
}
