#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_domain::{ConnId, RoomId, UserId};
use parley_protocol::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Registry-side handle to one live connection.
///
/// The registry holds the only `Sender` for the connection's outbound queue;
/// dropping the handle closes the queue.
#[derive(Debug)]
pub struct ConnectionHandle {
	pub conn_id: ConnId,
	pub user_id: UserId,
	outbound: mpsc::Sender<Frame>,
	shutdown: CancellationToken,
}

impl ConnectionHandle {
	pub fn new(conn_id: ConnId, user_id: UserId, outbound: mpsc::Sender<Frame>, shutdown: CancellationToken) -> Self {
		Self {
			conn_id,
			user_id,
			outbound,
			shutdown,
		}
	}

	fn try_enqueue(&self, frame: Frame) -> Delivery {
		match self.outbound.try_send(frame) {
			Ok(()) => Delivery::Queued,
			Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
			Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
		}
	}
}

/// Outcome of a single enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Queued,
	/// Queue full; the connection was evicted.
	Overflow,
	/// Writer already gone; the connection was evicted.
	Closed,
	/// No such live connection.
	Missing,
}

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOut {
	pub delivered: usize,
	pub evicted: Vec<ConnId>,
}

#[derive(Debug)]
struct LiveConn {
	handle: ConnectionHandle,
	rooms: HashSet<RoomId>,
}

/// Live connection set and in-session room index.
///
/// Only the room hub task owns a `HubState`, so none of this is locked.
#[derive(Debug, Default)]
pub struct HubState {
	conns: HashMap<ConnId, LiveConn>,

	rooms: HashMap<RoomId, HashSet<ConnId>>,

	conns_by_user: HashMap<UserId, HashSet<ConnId>>,
}

impl HubState {
	/// Adds a connection to the live set. Returns false if the id is already live.
	pub fn register(&mut self, handle: ConnectionHandle) -> bool {
		if self.conns.contains_key(&handle.conn_id) {
			return false;
		}

		self.conns_by_user
			.entry(handle.user_id)
			.or_default()
			.insert(handle.conn_id);
		self.conns.insert(
			handle.conn_id,
			LiveConn {
				handle,
				rooms: HashSet::new(),
			},
		);
		true
	}

	/// Removes a connection from the live set and from every room, signals its
	/// teardown and closes its outbound queue. Returns the rooms it left, or
	/// `None` if it was not live.
	pub fn unregister(&mut self, conn_id: ConnId) -> Option<Vec<RoomId>> {
		let live = self.conns.remove(&conn_id)?;

		if let Some(set) = self.conns_by_user.get_mut(&live.handle.user_id) {
			set.remove(&conn_id);
			if set.is_empty() {
				self.conns_by_user.remove(&live.handle.user_id);
			}
		}

		let mut left = Vec::with_capacity(live.rooms.len());
		for room in live.rooms {
			if let Some(members) = self.rooms.get_mut(&room) {
				members.remove(&conn_id);
				if members.is_empty() {
					self.rooms.remove(&room);
				}
			}
			left.push(room);
		}

		live.handle.shutdown.cancel();
		Some(left)
	}

	/// Returns true if the connection newly joined the room.
	pub fn join(&mut self, conn_id: ConnId, room: RoomId) -> bool {
		let Some(live) = self.conns.get_mut(&conn_id) else {
			return false;
		};

		if !live.rooms.insert(room) {
			return false;
		}

		self.rooms.entry(room).or_default().insert(conn_id);
		true
	}

	/// Returns true if the connection was a member and left.
	pub fn leave(&mut self, conn_id: ConnId, room: RoomId) -> bool {
		let Some(live) = self.conns.get_mut(&conn_id) else {
			return false;
		};

		if !live.rooms.remove(&room) {
			return false;
		}

		if let Some(members) = self.rooms.get_mut(&room) {
			members.remove(&conn_id);
			if members.is_empty() {
				self.rooms.remove(&room);
			}
		}
		true
	}

	/// Enqueue `frame` for every member of `room` except `except`.
	pub fn broadcast(&mut self, room: RoomId, frame: &Frame, except: Option<ConnId>) -> FanOut {
		let Some(members) = self.rooms.get(&room) else {
			return FanOut::default();
		};

		let targets: Vec<ConnId> = members.iter().copied().filter(|c| Some(*c) != except).collect();
		self.fan_out(targets, frame)
	}

	/// Enqueue `frame` for every live connection of `user_id`.
	pub fn deliver_to_user(&mut self, user_id: UserId, frame: &Frame) -> FanOut {
		let Some(conns) = self.conns_by_user.get(&user_id) else {
			return FanOut::default();
		};

		let targets: Vec<ConnId> = conns.iter().copied().collect();
		self.fan_out(targets, frame)
	}

	/// Enqueue `frame` for one connection.
	pub fn send_to(&mut self, conn_id: ConnId, frame: Frame) -> Delivery {
		let Some(live) = self.conns.get(&conn_id) else {
			return Delivery::Missing;
		};

		let outcome = live.handle.try_enqueue(frame);
		if matches!(outcome, Delivery::Overflow | Delivery::Closed) {
			self.unregister(conn_id);
		}
		outcome
	}

	fn fan_out(&mut self, targets: Vec<ConnId>, frame: &Frame) -> FanOut {
		let mut out = FanOut::default();

		for conn_id in targets {
			let Some(live) = self.conns.get(&conn_id) else {
				continue;
			};

			match live.handle.try_enqueue(frame.clone()) {
				Delivery::Queued => out.delivered += 1,
				_ => out.evicted.push(conn_id),
			}
		}

		for conn_id in &out.evicted {
			self.unregister(*conn_id);
		}

		out
	}

	pub fn connection_count(&self) -> usize {
		self.conns.len()
	}

	pub fn room_count(&self) -> usize {
		self.rooms.len()
	}

	/// Returns `(room -> in-session member count)`.
	pub fn room_member_counts(&self) -> HashMap<RoomId, usize> {
		self.rooms.iter().map(|(room, members)| (*room, members.len())).collect()
	}
}
