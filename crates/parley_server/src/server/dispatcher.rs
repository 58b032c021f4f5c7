#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parley_domain::{ConnId, RoomId, User, UserId};
use parley_protocol::{Inbound, Outbound, SendMessage};
use tracing::{debug, info, warn};

use crate::server::error::HandlerError;
use crate::server::invite::InviteSaga;
use crate::server::room_hub::RoomHub;
use crate::store::ChatStore;

/// Per-connection session state, owned by the connection's read loop.
#[derive(Debug, Clone)]
pub struct Session {
	pub conn_id: ConnId,
	pub user_id: UserId,
	pub username: String,

	/// Rooms joined on this socket. Distinct from durable membership.
	rooms: HashSet<RoomId>,
}

impl Session {
	pub fn new(conn_id: ConnId, user: &User) -> Self {
		Self {
			conn_id,
			user_id: user.id,
			username: user.username.clone(),
			rooms: HashSet::new(),
		}
	}

	pub fn is_in_room(&self, room_id: RoomId) -> bool {
		self.rooms.contains(&room_id)
	}

	pub fn join(&mut self, room_id: RoomId) -> bool {
		self.rooms.insert(room_id)
	}

	pub fn leave(&mut self, room_id: RoomId) -> bool {
		self.rooms.remove(&room_id)
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSettings {
	/// Require durable membership before a `join_room` is honored.
	pub join_requires_membership: bool,
}

/// Routes decoded envelopes to their handlers.
pub struct Dispatcher {
	store: Arc<dyn ChatStore>,
	hub: RoomHub,
	invites: InviteSaga,
	settings: DispatchSettings,
}

impl Dispatcher {
	pub fn new(store: Arc<dyn ChatStore>, hub: RoomHub, settings: DispatchSettings) -> Self {
		let invites = InviteSaga::new(store.clone(), hub.clone());
		Self {
			store,
			hub,
			invites,
			settings,
		}
	}

	pub fn store(&self) -> &Arc<dyn ChatStore> {
		&self.store
	}

	/// Handle one envelope. Failures go back to the sender as an `error`
	/// envelope; the connection is never closed from here.
	pub async fn dispatch(&self, session: &mut Session, envelope: Inbound) {
		let kind = envelope.kind();
		let result = match envelope {
			Inbound::JoinRoom(room) => self.join_room(session, room.0).await,
			Inbound::LeaveRoom(room) => self.leave_room(session, room.0).await,
			Inbound::Message(msg) => self.send_message(session, msg).await,
			Inbound::InviteUsers(invite) => self.invites.invite_users(session, invite).await,
			Inbound::AcceptInvite(room) => self.invites.accept(session, room.0).await,
			Inbound::RejectInvite(room) => self.invites.reject(session, room.0).await,
		};

		if let Err(err) = result {
			metrics::counter!("parley_server_handler_errors_total", "class" => err.class()).increment(1);
			match &err {
				HandlerError::Persistence { .. } => {
					warn!(conn_id = %session.conn_id, user_id = %session.user_id, kind, error = %err, "handler failed")
				}
				_ => debug!(conn_id = %session.conn_id, user_id = %session.user_id, kind, error = %err, "request refused"),
			}
			self.hub
				.send_envelope(session.conn_id, &Outbound::error(err.client_message()))
				.await;
		}
	}

	async fn join_room(&self, session: &mut Session, room_id: RoomId) -> Result<(), HandlerError> {
		if self.settings.join_requires_membership {
			let member = self
				.store
				.is_room_member(session.user_id, room_id)
				.await
				.map_err(HandlerError::persistence("Failed to join room"))?;
			if !member {
				return Err(HandlerError::Unauthorized("You don't have access to this room"));
			}
		}

		if session.join(room_id) {
			info!(conn_id = %session.conn_id, user_id = %session.user_id, %room_id, "joined room");
		}
		self.hub.join(session.conn_id, room_id).await;

		match self.store.touch_last_read(session.user_id, room_id).await {
			Ok(true) => {}
			Ok(false) => debug!(user_id = %session.user_id, %room_id, "no durable membership to stamp"),
			Err(e) => debug!(user_id = %session.user_id, %room_id, error = %e, "failed to update last read time"),
		}

		Ok(())
	}

	async fn leave_room(&self, session: &mut Session, room_id: RoomId) -> Result<(), HandlerError> {
		if session.leave(room_id) {
			info!(conn_id = %session.conn_id, user_id = %session.user_id, %room_id, "left room");
		}
		self.hub.leave(session.conn_id, room_id).await;
		Ok(())
	}

	async fn send_message(&self, session: &mut Session, msg: SendMessage) -> Result<(), HandlerError> {
		if !session.is_in_room(msg.room_id) {
			return Err(HandlerError::Unauthorized("You must join the room before sending messages"));
		}

		if msg.content.trim().is_empty() {
			return Err(HandlerError::Invalid("empty message"));
		}

		let saved = self
			.store
			.save_message(session.user_id, msg.room_id, &msg.content)
			.await
			.map_err(HandlerError::persistence("Failed to send message"))?;

		metrics::counter!("parley_server_messages_total").increment(1);
		let room_id = saved.room_id;
		self.hub.broadcast_envelope(room_id, &Outbound::Message(saved), None).await;
		Ok(())
	}
}
