#![forbid(unsafe_code)]

use thiserror::Error;

use crate::store::StoreError;

/// Failure of one inbound envelope. The connection stays open; the sender
/// gets an `error` envelope carrying `client_message()`.
#[derive(Debug, Error)]
pub enum HandlerError {
	#[error("invalid request: {0}")]
	Invalid(&'static str),

	#[error("not allowed: {0}")]
	Unauthorized(&'static str),

	#[error("not found: {0}")]
	NotFound(&'static str),

	#[error("conflict: {0}")]
	Conflict(&'static str),

	#[error("{message}: {source}")]
	Persistence {
		message: &'static str,
		#[source]
		source: StoreError,
	},
}

impl HandlerError {
	pub fn persistence(message: &'static str) -> impl FnOnce(StoreError) -> Self {
		move |source| Self::Persistence { message, source }
	}

	/// Text sent to the client. Store details never leave the server.
	pub fn client_message(&self) -> &'static str {
		match self {
			Self::Invalid(m) | Self::Unauthorized(m) | Self::NotFound(m) | Self::Conflict(m) => m,
			Self::Persistence { message, .. } => message,
		}
	}

	/// Metric label.
	pub fn class(&self) -> &'static str {
		match self {
			Self::Invalid(_) => "invalid",
			Self::Unauthorized(_) => "unauthorized",
			Self::NotFound(_) => "not_found",
			Self::Conflict(_) => "conflict",
			Self::Persistence { .. } => "persistence",
		}
	}
}
