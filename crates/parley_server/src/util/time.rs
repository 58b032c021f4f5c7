#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds; stored as `created_at` / `updated_at`.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Current Unix time in whole seconds; used for token expiry.
#[inline]
pub fn unix_secs_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_secs()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clocks_agree() {
		let ms = unix_ms_now();
		let secs = unix_secs_now() as i64;
		assert!(ms > 1_600_000_000_000);
		assert!((ms / 1000 - secs).abs() <= 1);
	}
}
