#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown invite status: {0}")]
	UnknownStatus(String),
}

macro_rules! numeric_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(into = "u64", try_from = "u64")]
		pub struct $name(u64);

		impl $name {
			/// Create a non-zero id.
			pub fn new(id: u64) -> Result<Self, ParseIdError> {
				if id == 0 {
					return Err(ParseIdError::InvalidFormat("id must be non-zero".into()));
				}
				Ok(Self(id))
			}

			pub const fn get(self) -> u64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl From<$name> for u64 {
			fn from(id: $name) -> u64 {
				id.0
			}
		}

		impl TryFrom<u64> for $name {
			type Error = ParseIdError;

			fn try_from(id: u64) -> Result<Self, Self::Error> {
				Self::new(id)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}

				let id = s
					.parse::<u64>()
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected a positive integer, got {s:?}")))?;
				Self::new(id)
			}
		}
	};
}

numeric_id!(
	/// Durable user identifier.
	UserId
);
numeric_id!(
	/// Durable room identifier.
	RoomId
);
numeric_id!(
	/// Durable invite request identifier.
	InviteId
);
numeric_id!(
	/// Durable chat message identifier.
	MessageId
);

/// Server-assigned id of one live socket; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// A registered user as seen by other room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub username: String,
	/// Four character discriminator; `username#tag` is unique.
	pub tag: String,
	pub created_at: i64,
	pub updated_at: i64,
}

impl User {
	/// `username#tag`.
	pub fn handle(&self) -> String {
		format!("{}#{}", self.username, self.tag)
	}
}

/// A chat room with its durable members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub created_by: UserId,
	pub created_at: i64,
	pub updated_at: i64,
	#[serde(default)]
	pub users: Vec<User>,
}

/// A persisted chat message with its sender's display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub content: String,
	pub room_id: RoomId,
	pub user_id: UserId,
	pub user: User,
	pub created_at: i64,
	pub updated_at: i64,
}

/// Lifecycle of an invite request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
	Pending,
	Accepted,
	Rejected,
}

impl InviteStatus {
	/// Stable string identifier, also the stored column value.
	pub const fn as_str(self) -> &'static str {
		match self {
			InviteStatus::Pending => "pending",
			InviteStatus::Accepted => "accepted",
			InviteStatus::Rejected => "rejected",
		}
	}
}

impl fmt::Display for InviteStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for InviteStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"pending" => Ok(InviteStatus::Pending),
			"accepted" => Ok(InviteStatus::Accepted),
			"rejected" => Ok(InviteStatus::Rejected),
			other => Err(ParseIdError::UnknownStatus(other.to_string())),
		}
	}
}

/// Invitation for `receiver_id` to join `room_id`, sent by `sender_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
	pub id: InviteId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub receiver_id: UserId,
	pub status: InviteStatus,
	pub created_at: i64,
	pub updated_at: i64,
}

impl Invite {
	pub fn is_pending(&self) -> bool {
		self.status == InviteStatus::Pending
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_parse_and_display() {
		assert_eq!("7".parse::<RoomId>().unwrap().get(), 7);
		assert_eq!(" 42 ".parse::<UserId>().unwrap().to_string(), "42");
		assert_eq!(ConnId(3).to_string(), "conn-3");
	}

	#[test]
	fn rejects_empty_zero_and_garbage_ids() {
		assert_eq!("".parse::<RoomId>().unwrap_err(), ParseIdError::Empty);
		assert!("0".parse::<RoomId>().is_err());
		assert!("-1".parse::<InviteId>().is_err());
		assert!("seven".parse::<MessageId>().is_err());
	}

	#[test]
	fn invite_status_roundtrip() {
		for status in [InviteStatus::Pending, InviteStatus::Accepted, InviteStatus::Rejected] {
			assert_eq!(status.as_str().parse::<InviteStatus>().unwrap(), status);
		}
		assert!(matches!(
			"expired".parse::<InviteStatus>(),
			Err(ParseIdError::UnknownStatus(_))
		));
	}

	#[test]
	fn ids_serialize_as_plain_numbers() {
		let id = RoomId::new(9).unwrap();
		assert_eq!(serde_json::to_string(&id).unwrap(), "9");
		assert_eq!(serde_json::from_str::<RoomId>("9").unwrap(), id);
		assert!(serde_json::from_str::<RoomId>("0").is_err());
	}

	#[test]
	fn user_handle_joins_name_and_tag() {
		let user = User {
			id: UserId::new(1).unwrap(),
			username: "bob".into(),
			tag: "1234".into(),
			created_at: 0,
			updated_at: 0,
		};
		assert_eq!(user.handle(), "bob#1234");
	}
}
