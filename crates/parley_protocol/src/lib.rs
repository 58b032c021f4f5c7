#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, Frame, decode_envelope, decode_envelope_default, encode_envelope};
pub use envelope::{
	ErrorPayload, Inbound, InviteReceived, InviteRejected, InviteRejectedConfirmation, InviteSent, InviteUsers, Outbound,
	RoomRef, SendMessage, UserJoined,
};

