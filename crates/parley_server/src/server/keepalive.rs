#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Liveness timing for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
	/// Longest silence tolerated from the peer before the connection is dropped.
	pub pong_wait: Duration,

	/// Deadline for one write (including a flush) to complete.
	pub write_wait: Duration,
}

impl Default for KeepaliveSettings {
	fn default() -> Self {
		Self {
			pong_wait: Duration::from_secs(60),
			write_wait: Duration::from_secs(10),
		}
	}
}

impl KeepaliveSettings {
	/// Pings go out at 90% of `pong_wait` so a pong can land before the deadline.
	pub fn ping_period(&self) -> Duration {
		self.pong_wait * 9 / 10
	}

	/// First tick fires one period from now, not immediately.
	pub fn ping_ticker(&self) -> Interval {
		let period = self.ping_period().max(Duration::from_millis(1));
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker
	}
}

/// Sliding read deadline; any inbound traffic pushes it out by `wait`.
#[derive(Debug)]
pub struct ReadDeadline {
	wait: Duration,
	deadline: Instant,
}

impl ReadDeadline {
	pub fn new(wait: Duration) -> Self {
		Self {
			wait,
			deadline: Instant::now() + wait,
		}
	}

	pub fn renew(&mut self) {
		self.deadline = Instant::now() + self.wait;
	}

	/// Resolves once the deadline passes.
	pub async fn elapsed(&self) {
		tokio::time::sleep_until(self.deadline).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ping_period_is_nine_tenths_of_pong_wait() {
		let k = KeepaliveSettings::default();
		assert_eq!(k.ping_period(), Duration::from_secs(54));
		assert!(k.ping_period() < k.pong_wait);
	}

	#[tokio::test]
	async fn ticker_does_not_fire_immediately() {
		let k = KeepaliveSettings {
			pong_wait: Duration::from_millis(200),
			write_wait: Duration::from_millis(50),
		};
		let mut ticker = k.ping_ticker();
		let started = Instant::now();
		ticker.tick().await;
		assert!(started.elapsed() >= Duration::from_millis(150));
	}

	#[tokio::test]
	async fn renew_pushes_deadline_out() {
		let mut deadline = ReadDeadline::new(Duration::from_millis(80));
		tokio::time::sleep(Duration::from_millis(50)).await;
		deadline.renew();

		let started = Instant::now();
		deadline.elapsed().await;
		assert!(started.elapsed() >= Duration::from_millis(60));
	}
}
