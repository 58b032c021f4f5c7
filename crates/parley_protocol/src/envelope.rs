#![forbid(unsafe_code)]

use parley_domain::{InviteId, Message, ParseIdError, Room, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Room id carried as a bare string payload (`"7"`).
///
/// Numbers are accepted as well so clients that send `7` are not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RoomRefRepr", into = "String")]
pub struct RoomRef(pub RoomId);

#[derive(Deserialize)]
#[serde(untagged)]
enum RoomRefRepr {
	Text(String),
	Number(u64),
}

impl TryFrom<RoomRefRepr> for RoomRef {
	type Error = ParseIdError;

	fn try_from(repr: RoomRefRepr) -> Result<Self, Self::Error> {
		match repr {
			RoomRefRepr::Text(s) => s.parse().map(RoomRef),
			RoomRefRepr::Number(n) => RoomId::new(n).map(RoomRef),
		}
	}
}

impl From<RoomRef> for String {
	fn from(r: RoomRef) -> String {
		r.0.to_string()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
	pub room_id: RoomId,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteUsers {
	pub room_id: RoomId,
	pub username: String,
	pub tag: String,
}

/// Client to server envelopes: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Inbound {
	JoinRoom(RoomRef),
	LeaveRoom(RoomRef),
	Message(SendMessage),
	InviteUsers(InviteUsers),
	AcceptInvite(RoomRef),
	RejectInvite(RoomRef),
}

impl Inbound {
	/// Wire `type` string, used for logs and metric labels.
	pub const fn kind(&self) -> &'static str {
		match self {
			Inbound::JoinRoom(_) => "join_room",
			Inbound::LeaveRoom(_) => "leave_room",
			Inbound::Message(_) => "message",
			Inbound::InviteUsers(_) => "invite_users",
			Inbound::AcceptInvite(_) => "accept_invite",
			Inbound::RejectInvite(_) => "reject_invite",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteReceived {
	pub invite_id: InviteId,
	pub room_id: RoomId,
	pub room_name: String,
	/// Sender's username.
	pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSent {
	pub invite_id: InviteId,
	pub room_id: RoomId,
	pub room_name: String,
	pub receiver_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoined {
	pub room_id: RoomId,
	pub user_id: UserId,
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRejected {
	pub invite_id: InviteId,
	pub room_id: RoomId,
	/// The user who rejected.
	pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRejectedConfirmation {
	pub invite_id: InviteId,
	pub room_id: RoomId,
}

/// Server to client envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
	Error(ErrorPayload),
	InviteReceived(InviteReceived),
	InviteSent(InviteSent),
	UserJoined(UserJoined),
	RoomJoined(Room),
	InviteRejected(InviteRejected),
	InviteRejectedConfirmation(InviteRejectedConfirmation),
	Message(Message),
}

impl Outbound {
	pub fn error(message: impl Into<String>) -> Self {
		Outbound::Error(ErrorPayload {
			message: message.into(),
		})
	}

	pub const fn kind(&self) -> &'static str {
		match self {
			Outbound::Error(_) => "error",
			Outbound::InviteReceived(_) => "invite_received",
			Outbound::InviteSent(_) => "invite_sent",
			Outbound::UserJoined(_) => "user_joined",
			Outbound::RoomJoined(_) => "room_joined",
			Outbound::InviteRejected(_) => "invite_rejected",
			Outbound::InviteRejectedConfirmation(_) => "invite_rejected_confirmation",
			Outbound::Message(_) => "message",
		}
	}
}
