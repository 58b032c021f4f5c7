#![forbid(unsafe_code)]

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use parley_domain::{Invite, InviteId, InviteStatus, Message, Room, RoomId, User, UserId};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("{0} not found")]
	NotFound(&'static str),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("invalid row: {0}")]
	InvalidRow(String),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Durable chat state the hub reads and writes.
///
/// Users and rooms are created elsewhere; the hub only looks them up.
#[async_trait]
pub trait ChatStore: Send + Sync {
	async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError>;

	/// Match on both `username` and `tag`.
	async fn find_user_by_handle(&self, username: &str, tag: &str) -> Result<Option<User>, StoreError>;

	/// Persist a message and return it with the sender embedded.
	async fn save_message(&self, user_id: UserId, room_id: RoomId, content: &str) -> Result<Message, StoreError>;

	async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError>;

	async fn has_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<bool, StoreError>;

	async fn find_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<Option<Invite>, StoreError>;

	/// Create a `pending` invite. A second pending invite for the same pair is a conflict.
	async fn create_invite(&self, room_id: RoomId, sender_id: UserId, receiver_id: UserId)
	-> Result<Invite, StoreError>;

	/// Move an invite from `expected` to `status`. Returns false if the invite
	/// was not in `expected` (already processed).
	async fn update_invite_status(
		&self,
		invite_id: InviteId,
		expected: InviteStatus,
		status: InviteStatus,
	) -> Result<bool, StoreError>;

	/// A duplicate membership is a conflict.
	async fn create_room_membership(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError>;

	/// The room with its members populated.
	async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError>;

	/// Stamp the member's last-read time. Returns false if there is no durable membership.
	async fn touch_last_read(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError>;
}
