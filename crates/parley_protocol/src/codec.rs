#![forbid(unsafe_code)]

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum inbound envelope size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame is not valid utf-8")]
	NotUtf8,

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// An encoded JSON envelope, ready to be written as one text message.
///
/// Cloning is cheap; broadcasts share the same buffer across recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn into_bytes(self) -> Bytes {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// The frame text. Frames are always produced by `encode_envelope`.
	pub fn as_str(&self) -> &str {
		std::str::from_utf8(&self.0).unwrap_or_default()
	}
}

/// Encode an envelope into a frame.
pub fn encode_envelope<T: Serialize>(envelope: &T) -> Result<Frame, CodecError> {
	let buf = serde_json::to_vec(envelope)?;
	Ok(Frame(Bytes::from(buf)))
}

/// Decode an envelope from raw frame bytes, enforcing `max_frame_size`.
pub fn decode_envelope<T: DeserializeOwned>(src: &[u8], max_frame_size: usize) -> Result<T, CodecError> {
	if src.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let text = std::str::from_utf8(src).map_err(|_| CodecError::NotUtf8)?;
	Ok(serde_json::from_str(text)?)
}

/// Decode an envelope using `DEFAULT_MAX_FRAME_SIZE`.
pub fn decode_envelope_default<T: DeserializeOwned>(src: &[u8]) -> Result<T, CodecError> {
	decode_envelope(src, DEFAULT_MAX_FRAME_SIZE)
}
