#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use parley_domain::{Invite, InviteId, InviteStatus, Message, MessageId, Room, RoomId, User, UserId};
use tokio::sync::Mutex;

use crate::store::{ChatStore, StoreError};
use crate::util::time::unix_ms_now;

/// Process-local store for development and tests. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	next_id: u64,
	users: BTreeMap<UserId, User>,
	rooms: BTreeMap<RoomId, RoomRow>,
	members: BTreeMap<(RoomId, UserId), MemberRow>,
	messages: Vec<Message>,
	invites: BTreeMap<InviteId, Invite>,
}

#[derive(Debug, Clone)]
struct RoomRow {
	id: RoomId,
	name: String,
	created_by: UserId,
	created_at: i64,
	updated_at: i64,
}

#[derive(Debug, Clone, Default)]
struct MemberRow {
	last_read_at: Option<i64>,
}

impl Inner {
	fn next_raw_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn room_with_users(&self, row: &RoomRow) -> Room {
		let users = self
			.members
			.keys()
			.filter(|(room_id, _)| *room_id == row.id)
			.filter_map(|(_, user_id)| self.users.get(user_id).cloned())
			.collect();

		Room {
			id: row.id,
			name: row.name.clone(),
			created_by: row.created_by,
			created_at: row.created_at,
			updated_at: row.updated_at,
			users,
		}
	}
}

fn invalid_id(e: parley_domain::ParseIdError) -> StoreError {
	StoreError::InvalidRow(e.to_string())
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a user. Rejects a taken `username#tag`.
	pub async fn insert_user(&self, username: &str, tag: &str) -> Result<User, StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.users.values().any(|u| u.username == username && u.tag == tag) {
			return Err(StoreError::Conflict(format!("user {username}#{tag} already exists")));
		}

		let now = unix_ms_now();
		let id = UserId::new(inner.next_raw_id()).map_err(invalid_id)?;
		let user = User {
			id,
			username: username.to_string(),
			tag: tag.to_string(),
			created_at: now,
			updated_at: now,
		};
		inner.users.insert(id, user.clone());
		Ok(user)
	}

	/// Create a room; the creator becomes its first member.
	pub async fn insert_room(&self, name: &str, created_by: UserId) -> Result<Room, StoreError> {
		let mut inner = self.inner.lock().await;
		if !inner.users.contains_key(&created_by) {
			return Err(StoreError::NotFound("user"));
		}

		let now = unix_ms_now();
		let id = RoomId::new(inner.next_raw_id()).map_err(invalid_id)?;
		let row = RoomRow {
			id,
			name: name.to_string(),
			created_by,
			created_at: now,
			updated_at: now,
		};
		inner.rooms.insert(id, row.clone());
		inner.members.insert((id, created_by), MemberRow::default());
		Ok(inner.room_with_users(&row))
	}

	/// Messages stored for a room, oldest first.
	#[cfg(test)]
	pub async fn messages_in(&self, room_id: RoomId) -> Vec<Message> {
		let inner = self.inner.lock().await;
		inner.messages.iter().filter(|m| m.room_id == room_id).cloned().collect()
	}

	#[cfg(test)]
	pub async fn last_read_at(&self, user_id: UserId, room_id: RoomId) -> Option<i64> {
		let inner = self.inner.lock().await;
		inner.members.get(&(room_id, user_id)).and_then(|m| m.last_read_at)
	}

	#[cfg(test)]
	pub async fn invite(&self, invite_id: InviteId) -> Option<Invite> {
		self.inner.lock().await.invites.get(&invite_id).cloned()
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
		Ok(self.inner.lock().await.users.get(&user_id).cloned())
	}

	async fn find_user_by_handle(&self, username: &str, tag: &str) -> Result<Option<User>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.users
			.values()
			.find(|u| u.username == username && u.tag == tag)
			.cloned())
	}

	async fn save_message(&self, user_id: UserId, room_id: RoomId, content: &str) -> Result<Message, StoreError> {
		let mut inner = self.inner.lock().await;
		let user = inner.users.get(&user_id).cloned().ok_or(StoreError::NotFound("user"))?;
		if !inner.rooms.contains_key(&room_id) {
			return Err(StoreError::NotFound("room"));
		}

		let now = unix_ms_now();
		let message = Message {
			id: MessageId::new(inner.next_raw_id()).map_err(invalid_id)?,
			content: content.to_string(),
			room_id,
			user_id,
			user,
			created_at: now,
			updated_at: now,
		};
		inner.messages.push(message.clone());
		Ok(message)
	}

	async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
		Ok(self.inner.lock().await.members.contains_key(&(room_id, user_id)))
	}

	async fn has_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<bool, StoreError> {
		Ok(self.find_pending_invite(room_id, receiver_id).await?.is_some())
	}

	async fn find_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<Option<Invite>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.invites
			.values()
			.find(|i| i.room_id == room_id && i.receiver_id == receiver_id && i.is_pending())
			.cloned())
	}

	async fn create_invite(
		&self,
		room_id: RoomId,
		sender_id: UserId,
		receiver_id: UserId,
	) -> Result<Invite, StoreError> {
		let mut inner = self.inner.lock().await;
		if inner
			.invites
			.values()
			.any(|i| i.room_id == room_id && i.receiver_id == receiver_id && i.is_pending())
		{
			return Err(StoreError::Conflict("pending invite already exists".into()));
		}

		let now = unix_ms_now();
		let invite = Invite {
			id: InviteId::new(inner.next_raw_id()).map_err(invalid_id)?,
			room_id,
			sender_id,
			receiver_id,
			status: InviteStatus::Pending,
			created_at: now,
			updated_at: now,
		};
		inner.invites.insert(invite.id, invite.clone());
		Ok(invite)
	}

	async fn update_invite_status(
		&self,
		invite_id: InviteId,
		expected: InviteStatus,
		status: InviteStatus,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		let Some(invite) = inner.invites.get_mut(&invite_id) else {
			return Ok(false);
		};

		if invite.status != expected {
			return Ok(false);
		}

		invite.status = status;
		invite.updated_at = unix_ms_now();
		Ok(true)
	}

	async fn create_room_membership(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		if !inner.rooms.contains_key(&room_id) {
			return Err(StoreError::NotFound("room"));
		}
		if inner.members.contains_key(&(room_id, user_id)) {
			return Err(StoreError::Conflict("already a member".into()));
		}

		inner.members.insert((room_id, user_id), MemberRow::default());
		Ok(())
	}

	async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&room_id).map(|row| inner.room_with_users(row)))
	}

	async fn touch_last_read(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		match inner.members.get_mut(&(room_id, user_id)) {
			Some(member) => {
				member.last_read_at = Some(unix_ms_now());
				Ok(true)
			}
			None => Ok(false),
		}
	}
}
