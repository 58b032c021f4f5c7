#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{InviteId, InviteStatus, Room, RoomId};
use parley_protocol::{
	InviteReceived, InviteRejected, InviteRejectedConfirmation, InviteSent, InviteUsers, Outbound, UserJoined,
};
use tracing::{error, info, warn};

use crate::server::dispatcher::Session;
use crate::server::error::HandlerError;
use crate::server::room_hub::RoomHub;
use crate::store::{ChatStore, StoreError};

const INVITE_NOT_FOUND: &str = "Invitation not found or already processed";

/// Invite, accept and reject. The store holds the invite state of record;
/// live notifications through the hub are best effort.
pub struct InviteSaga {
	store: Arc<dyn ChatStore>,
	hub: RoomHub,
}

impl InviteSaga {
	pub fn new(store: Arc<dyn ChatStore>, hub: RoomHub) -> Self {
		Self { store, hub }
	}

	pub async fn invite_users(&self, session: &Session, req: InviteUsers) -> Result<(), HandlerError> {
		if !session.is_in_room(req.room_id) {
			return Err(HandlerError::Unauthorized(
				"You must be a member of the room to invite others",
			));
		}

		let receiver = self
			.store
			.find_user_by_handle(&req.username, &req.tag)
			.await
			.map_err(HandlerError::persistence("Failed to create invitation"))?
			.ok_or(HandlerError::NotFound("User not found"))?;

		let already_member = self
			.store
			.is_room_member(receiver.id, req.room_id)
			.await
			.map_err(HandlerError::persistence("Failed to create invitation"))?;
		if already_member {
			return Err(HandlerError::Conflict("User is already a member of this room"));
		}

		let pending = self
			.store
			.has_pending_invite(req.room_id, receiver.id)
			.await
			.map_err(HandlerError::persistence("Failed to create invitation"))?;
		if pending {
			return Err(HandlerError::Conflict("An invitation has already been sent to this user"));
		}

		let room = self
			.store
			.get_room(req.room_id)
			.await
			.map_err(HandlerError::persistence("Failed to create invitation"))?
			.ok_or(HandlerError::NotFound("Room not found"))?;

		let invite = match self.store.create_invite(room.id, session.user_id, receiver.id).await {
			Ok(invite) => invite,
			// lost a race with a concurrent invite for the same pair
			Err(StoreError::Conflict(_)) => {
				return Err(HandlerError::Conflict("An invitation has already been sent to this user"));
			}
			Err(e) => return Err(HandlerError::persistence("Failed to create invitation")(e)),
		};

		metrics::counter!("parley_server_invites_sent_total").increment(1);
		info!(
			invite_id = %invite.id,
			room_id = %room.id,
			sender_id = %session.user_id,
			receiver_id = %receiver.id,
			"invite created"
		);

		let received = Outbound::InviteReceived(InviteReceived {
			invite_id: invite.id,
			room_id: room.id,
			room_name: room.name.clone(),
			sender: session.username.clone(),
		});
		self.hub.deliver_envelope(receiver.id, &received).await;

		let sent = Outbound::InviteSent(InviteSent {
			invite_id: invite.id,
			room_id: room.id,
			room_name: room.name,
			receiver_id: receiver.id,
		});
		self.hub.send_envelope(session.conn_id, &sent).await;

		Ok(())
	}

	pub async fn accept(&self, session: &mut Session, room_id: RoomId) -> Result<(), HandlerError> {
		let invite = self
			.store
			.find_pending_invite(room_id, session.user_id)
			.await
			.map_err(HandlerError::persistence("Failed to accept invitation"))?
			.ok_or(HandlerError::NotFound(INVITE_NOT_FOUND))?;

		// loaded before anything is committed so a lookup failure leaves the invite pending
		let room = self
			.store
			.get_room(room_id)
			.await
			.map_err(HandlerError::persistence("Failed to accept invitation"))?
			.ok_or(HandlerError::NotFound("Room not found"))?;

		let updated = self
			.store
			.update_invite_status(invite.id, InviteStatus::Pending, InviteStatus::Accepted)
			.await
			.map_err(HandlerError::persistence("Failed to accept invitation"))?;
		if !updated {
			return Err(HandlerError::NotFound(INVITE_NOT_FOUND));
		}

		match self.store.create_room_membership(room_id, session.user_id).await {
			Ok(()) | Err(StoreError::Conflict(_)) => {}
			Err(e) => {
				self.revert_accept(invite.id, session).await;
				return Err(HandlerError::persistence("Failed to join room")(e));
			}
		}

		metrics::counter!("parley_server_invites_accepted_total").increment(1);
		info!(invite_id = %invite.id, %room_id, user_id = %session.user_id, "invite accepted");

		let room = self.refreshed_room(room, session).await;

		session.join(room_id);
		self.hub.join(session.conn_id, room_id).await;

		let joined = Outbound::UserJoined(UserJoined {
			room_id,
			user_id: session.user_id,
			username: session.username.clone(),
		});
		self.hub.broadcast_envelope(room_id, &joined, Some(session.conn_id)).await;
		self.hub.send_envelope(session.conn_id, &Outbound::RoomJoined(room)).await;

		Ok(())
	}

	/// Re-read the room so its member list includes the acceptor. The membership
	/// is already committed, so a failed read falls back to `loaded` plus the acceptor.
	async fn refreshed_room(&self, loaded: Room, session: &Session) -> Room {
		let err = match self.store.get_room(loaded.id).await {
			Ok(Some(room)) => return room,
			Ok(None) => "room vanished".to_string(),
			Err(e) => e.to_string(),
		};
		warn!(room_id = %loaded.id, user_id = %session.user_id, error = %err, "room reload failed after accept");

		let mut room = loaded;
		if let Ok(Some(user)) = self.store.get_user(session.user_id).await
			&& !room.users.iter().any(|u| u.id == user.id)
		{
			room.users.push(user);
		}
		room
	}

	/// Put an accepted invite back to pending after membership creation failed.
	async fn revert_accept(&self, invite_id: InviteId, session: &Session) {
		match self
			.store
			.update_invite_status(invite_id, InviteStatus::Accepted, InviteStatus::Pending)
			.await
		{
			Ok(true) => {
				metrics::counter!("parley_server_invites_reverted_total").increment(1);
				info!(%invite_id, user_id = %session.user_id, "invite reverted to pending");
			}
			Ok(false) => error!(%invite_id, user_id = %session.user_id, "invite changed state before revert"),
			Err(e) => error!(%invite_id, user_id = %session.user_id, error = %e, "failed to revert accepted invite"),
		}
	}

	pub async fn reject(&self, session: &Session, room_id: RoomId) -> Result<(), HandlerError> {
		let invite = self
			.store
			.find_pending_invite(room_id, session.user_id)
			.await
			.map_err(HandlerError::persistence("Failed to reject invitation"))?
			.ok_or(HandlerError::NotFound(INVITE_NOT_FOUND))?;

		let updated = self
			.store
			.update_invite_status(invite.id, InviteStatus::Pending, InviteStatus::Rejected)
			.await
			.map_err(HandlerError::persistence("Failed to reject invitation"))?;
		if !updated {
			return Err(HandlerError::NotFound(INVITE_NOT_FOUND));
		}

		metrics::counter!("parley_server_invites_rejected_total").increment(1);
		info!(invite_id = %invite.id, %room_id, user_id = %session.user_id, "invite rejected");

		let rejected = Outbound::InviteRejected(InviteRejected {
			invite_id: invite.id,
			room_id,
			user_id: session.user_id,
		});
		self.hub.deliver_envelope(invite.sender_id, &rejected).await;

		let confirmation = Outbound::InviteRejectedConfirmation(InviteRejectedConfirmation {
			invite_id: invite.id,
			room_id,
		});
		self.hub.send_envelope(session.conn_id, &confirmation).await;

		Ok(())
	}
}
