#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parley_domain::{Invite, InviteId, InviteStatus, Message, MessageId, Room, RoomId, User, UserId};
use sqlx::sqlite::SqlitePoolOptions;

use crate::store::{ChatStore, StoreError};
use crate::util::time::unix_ms_now;

type UserRow = (i64, String, String, i64, i64);
type InviteRow = (i64, i64, i64, i64, String, i64, i64);

const USER_COLUMNS: &str = "id, username, tag, created_at, updated_at";
const INVITE_COLUMNS: &str = "id, room_id, sender_id, receiver_id, status, created_at, updated_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	/// Connect and apply migrations. Only `sqlite:` URLs are supported.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url for chat store (expected sqlite:...)"));
		}

		// every in-memory connection is a separate database
		let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect(database_url)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	async fn users_in_room(&self, room_id: RoomId) -> Result<Vec<User>, StoreError> {
		let rows: Vec<UserRow> = sqlx::query_as(
			"SELECT u.id, u.username, u.tag, u.created_at, u.updated_at \
			FROM users u JOIN room_users ru ON ru.user_id = u.id \
			WHERE ru.room_id = ? ORDER BY u.id",
		)
		.bind(raw(room_id.get()))
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(user_from_row).collect()
	}
}

fn raw(id: u64) -> i64 {
	id as i64
}

fn id_from<T>(v: i64, make: fn(u64) -> Result<T, parley_domain::ParseIdError>) -> Result<T, StoreError> {
	let v = u64::try_from(v).map_err(|_| StoreError::InvalidRow(format!("negative id {v}")))?;
	make(v).map_err(|e| StoreError::InvalidRow(e.to_string()))
}

fn user_from_row((id, username, tag, created_at, updated_at): UserRow) -> Result<User, StoreError> {
	Ok(User {
		id: id_from(id, UserId::new)?,
		username,
		tag,
		created_at,
		updated_at,
	})
}

fn invite_from_row(
	(id, room_id, sender_id, receiver_id, status, created_at, updated_at): InviteRow,
) -> Result<Invite, StoreError> {
	Ok(Invite {
		id: id_from(id, InviteId::new)?,
		room_id: id_from(room_id, RoomId::new)?,
		sender_id: id_from(sender_id, UserId::new)?,
		receiver_id: id_from(receiver_id, UserId::new)?,
		status: status
			.parse::<InviteStatus>()
			.map_err(|e| StoreError::InvalidRow(e.to_string()))?,
		created_at,
		updated_at,
	})
}

fn map_unique_violation(err: sqlx::Error, what: &str) -> StoreError {
	match &err {
		sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what.to_string()),
		_ => StoreError::Database(err),
	}
}

#[async_trait]
impl ChatStore for SqliteStore {
	async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StoreError> {
		let row: Option<UserRow> = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
			.bind(raw(user_id.get()))
			.fetch_optional(&self.pool)
			.await?;

		row.map(user_from_row).transpose()
	}

	async fn find_user_by_handle(&self, username: &str, tag: &str) -> Result<Option<User>, StoreError> {
		let row: Option<UserRow> =
			sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ? AND tag = ?"))
				.bind(username)
				.bind(tag)
				.fetch_optional(&self.pool)
				.await?;

		row.map(user_from_row).transpose()
	}

	async fn save_message(&self, user_id: UserId, room_id: RoomId, content: &str) -> Result<Message, StoreError> {
		let user = self.get_user(user_id).await?.ok_or(StoreError::NotFound("user"))?;

		let now = unix_ms_now();
		let result = sqlx::query(
			"INSERT INTO messages (content, room_id, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
		)
		.bind(content)
		.bind(raw(room_id.get()))
		.bind(raw(user_id.get()))
		.bind(now)
		.bind(now)
		.execute(&self.pool)
		.await?;

		Ok(Message {
			id: id_from(result.last_insert_rowid(), MessageId::new)?,
			content: content.to_string(),
			room_id,
			user_id,
			user,
			created_at: now,
			updated_at: now,
		})
	}

	async fn is_room_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM room_users WHERE room_id = ? AND user_id = ?")
			.bind(raw(room_id.get()))
			.bind(raw(user_id.get()))
			.fetch_optional(&self.pool)
			.await?;

		Ok(row.is_some())
	}

	async fn has_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<bool, StoreError> {
		Ok(self.find_pending_invite(room_id, receiver_id).await?.is_some())
	}

	async fn find_pending_invite(&self, room_id: RoomId, receiver_id: UserId) -> Result<Option<Invite>, StoreError> {
		let row: Option<InviteRow> = sqlx::query_as(&format!(
			"SELECT {INVITE_COLUMNS} FROM invite_requests \
			WHERE room_id = ? AND receiver_id = ? AND status = 'pending'"
		))
		.bind(raw(room_id.get()))
		.bind(raw(receiver_id.get()))
		.fetch_optional(&self.pool)
		.await?;

		row.map(invite_from_row).transpose()
	}

	async fn create_invite(
		&self,
		room_id: RoomId,
		sender_id: UserId,
		receiver_id: UserId,
	) -> Result<Invite, StoreError> {
		let now = unix_ms_now();
		let result = sqlx::query(
			"INSERT INTO invite_requests (room_id, sender_id, receiver_id, status, created_at, updated_at) \
			VALUES (?, ?, ?, 'pending', ?, ?)",
		)
		.bind(raw(room_id.get()))
		.bind(raw(sender_id.get()))
		.bind(raw(receiver_id.get()))
		.bind(now)
		.bind(now)
		.execute(&self.pool)
		.await
		.map_err(|e| map_unique_violation(e, "pending invite already exists"))?;

		Ok(Invite {
			id: id_from(result.last_insert_rowid(), InviteId::new)?,
			room_id,
			sender_id,
			receiver_id,
			status: InviteStatus::Pending,
			created_at: now,
			updated_at: now,
		})
	}

	async fn update_invite_status(
		&self,
		invite_id: InviteId,
		expected: InviteStatus,
		status: InviteStatus,
	) -> Result<bool, StoreError> {
		let result = sqlx::query("UPDATE invite_requests SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
			.bind(status.as_str())
			.bind(unix_ms_now())
			.bind(raw(invite_id.get()))
			.bind(expected.as_str())
			.execute(&self.pool)
			.await
			.map_err(|e| map_unique_violation(e, "pending invite already exists"))?;

		Ok(result.rows_affected() == 1)
	}

	async fn create_room_membership(&self, room_id: RoomId, user_id: UserId) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO room_users (room_id, user_id, created_at) VALUES (?, ?, ?)")
			.bind(raw(room_id.get()))
			.bind(raw(user_id.get()))
			.bind(unix_ms_now())
			.execute(&self.pool)
			.await
			.map_err(|e| map_unique_violation(e, "already a member"))?;

		Ok(())
	}

	async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<(i64, String, i64, i64, i64)> =
			sqlx::query_as("SELECT id, name, created_by, created_at, updated_at FROM rooms WHERE id = ?")
				.bind(raw(room_id.get()))
				.fetch_optional(&self.pool)
				.await?;

		let Some((id, name, created_by, created_at, updated_at)) = row else {
			return Ok(None);
		};

		Ok(Some(Room {
			id: id_from(id, RoomId::new)?,
			name,
			created_by: id_from(created_by, UserId::new)?,
			created_at,
			updated_at,
			users: self.users_in_room(room_id).await?,
		}))
	}

	async fn touch_last_read(&self, user_id: UserId, room_id: RoomId) -> Result<bool, StoreError> {
		let result = sqlx::query("UPDATE room_users SET last_read_at = ? WHERE room_id = ? AND user_id = ?")
			.bind(unix_ms_now())
			.bind(raw(room_id.get()))
			.bind(raw(user_id.get()))
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected() > 0)
	}
}
