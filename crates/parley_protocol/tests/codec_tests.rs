use parley_domain::{InviteId, Message, MessageId, Room, RoomId, User, UserId};
use parley_protocol::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, Inbound, InviteReceived, InviteUsers, Outbound, RoomRef, SendMessage,
	decode_envelope, decode_envelope_default, encode_envelope,
};
use proptest::prelude::*;
use serde_json::{Value, json};

fn room(id: u64) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn user(id: u64, name: &str) -> User {
	User {
		id: UserId::new(id).expect("valid UserId"),
		username: name.to_string(),
		tag: "1234".to_string(),
		created_at: 1_700_000_000_000,
		updated_at: 1_700_000_000_000,
	}
}

fn decode_str(s: &str) -> Result<Inbound, CodecError> {
	decode_envelope_default::<Inbound>(s.as_bytes())
}

#[test]
fn decodes_every_inbound_shape() {
	assert_eq!(
		decode_str(r#"{"type":"join_room","payload":"7"}"#).expect("join_room"),
		Inbound::JoinRoom(RoomRef(room(7)))
	);
	assert_eq!(
		decode_str(r#"{"type":"leave_room","payload":"7"}"#).expect("leave_room"),
		Inbound::LeaveRoom(RoomRef(room(7)))
	);
	assert_eq!(
		decode_str(r#"{"type":"message","payload":{"room_id":7,"content":"hi"}}"#).expect("message"),
		Inbound::Message(SendMessage {
			room_id: room(7),
			content: "hi".to_string(),
		})
	);
	assert_eq!(
		decode_str(r#"{"type":"invite_users","payload":{"room_id":7,"username":"bob","tag":"1234"}}"#)
			.expect("invite_users"),
		Inbound::InviteUsers(InviteUsers {
			room_id: room(7),
			username: "bob".to_string(),
			tag: "1234".to_string(),
		})
	);
	assert_eq!(
		decode_str(r#"{"type":"accept_invite","payload":"7"}"#).expect("accept_invite"),
		Inbound::AcceptInvite(RoomRef(room(7)))
	);
	assert_eq!(
		decode_str(r#"{"type":"reject_invite","payload":"7"}"#).expect("reject_invite"),
		Inbound::RejectInvite(RoomRef(room(7)))
	);
}

#[test]
fn room_ref_accepts_a_bare_number() {
	assert_eq!(
		decode_str(r#"{"type":"join_room","payload":12}"#).expect("numeric room id"),
		Inbound::JoinRoom(RoomRef(room(12)))
	);
}

#[test]
fn rejects_malformed_envelopes() {
	for bad in [
		"",
		"not json",
		r#"{"type":"join_room"}"#,
		r#"{"type":"join_room","payload":"seven"}"#,
		r#"{"type":"join_room","payload":"0"}"#,
		r#"{"type":"shout","payload":"7"}"#,
		r#"{"type":"message","payload":{"room_id":"x","content":"hi"}}"#,
		r#"{"payload":"7"}"#,
	] {
		assert!(decode_str(bad).is_err(), "expected decode failure for {bad:?}");
	}
}

#[test]
fn enforces_explicit_frame_limit() {
	let frame = r#"{"type":"join_room","payload":"7"}"#;
	assert!(decode_envelope::<Inbound>(frame.as_bytes(), frame.len()).is_ok());

	match decode_envelope::<Inbound>(frame.as_bytes(), frame.len() - 1) {
		Err(CodecError::FrameTooLarge { len, max }) => {
			assert_eq!(len, frame.len());
			assert_eq!(max, frame.len() - 1);
		}
		other => panic!("expected FrameTooLarge, got: {other:?}"),
	}
}

#[test]
fn outbound_payload_fields_match_wire_names() {
	let frame = encode_envelope(&Outbound::InviteReceived(InviteReceived {
		invite_id: InviteId::new(3).expect("valid InviteId"),
		room_id: room(7),
		room_name: "general".to_string(),
		sender: "alice".to_string(),
	}))
	.expect("encode");

	let v: Value = serde_json::from_slice(frame.as_bytes()).expect("json");
	assert_eq!(
		v,
		json!({
			"type": "invite_received",
			"payload": {"invite_id": 3, "room_id": 7, "room_name": "general", "sender": "alice"}
		})
	);
}

#[test]
fn room_joined_carries_the_room_object() {
	let r = Room {
		id: room(7),
		name: "general".to_string(),
		created_by: UserId::new(1).expect("valid UserId"),
		created_at: 1,
		updated_at: 2,
		users: vec![user(1, "alice"), user(2, "bob")],
	};

	let frame = encode_envelope(&Outbound::RoomJoined(r)).expect("encode");
	let v: Value = serde_json::from_slice(frame.as_bytes()).expect("json");

	assert_eq!(v["type"], "room_joined");
	assert_eq!(v["payload"]["id"], 7);
	assert_eq!(v["payload"]["users"].as_array().map(Vec::len), Some(2));
	assert_eq!(v["payload"]["users"][1]["username"], "bob");
}

#[test]
fn default_limit_is_ten_thousand_bytes() {
	assert_eq!(DEFAULT_MAX_FRAME_SIZE, 10_000);
}

proptest! {
	#[test]
	fn decoder_never_panics_on_arbitrary_text(s in ".{0,256}") {
		let _ = decode_str(&s);
	}

	#[test]
	fn message_content_survives_the_wire(id in 1u64..1_000_000, content in ".{0,200}") {
		let msg = Outbound::Message(Message {
			id: MessageId::new(id).expect("valid MessageId"),
			content: content.clone(),
			room_id: room(id),
			user_id: UserId::new(id).expect("valid UserId"),
			user: user(id, "alice"),
			created_at: 0,
			updated_at: 0,
		});

		let frame = encode_envelope(&msg).expect("encode");
		let back: Outbound = decode_envelope(frame.as_bytes(), usize::MAX).expect("decode");
		prop_assert_eq!(back, msg);
	}
}
