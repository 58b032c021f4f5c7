#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parley_domain::{ConnId, UserId};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, Frame, Inbound, Outbound, decode_envelope};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::auth::UpgradeAuth;
use crate::server::dispatcher::{Dispatcher, Session};
use crate::server::keepalive::{KeepaliveSettings, ReadDeadline};
use crate::server::room_hub::RoomHub;
use crate::server::state::ConnectionHandle;

/// Close code sent when the authenticated user does not exist.
pub const CLOSE_UNKNOWN_USER: u16 = 4004;

/// Frames written per flush.
const MAX_COALESCED_FRAMES: usize = 64;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_message_bytes: usize,

	pub outbound_queue_capacity: usize,

	pub keepalive: KeepaliveSettings,

	pub auth: UpgradeAuth,

	/// Only upgrade requests for this path are accepted; `None` accepts any path.
	pub upgrade_path: Option<String>,

	pub rate_limit_burst: u32,
	pub rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_message_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			keepalive: KeepaliveSettings::default(),
			auth: UpgradeAuth::default(),
			upgrade_path: None,
			rate_limit_burst: 0,
			rate_limit_per_minute: 0,
		}
	}
}

/// Everything a connection task needs, cloned per accepted socket.
#[derive(Clone)]
pub struct ConnectionContext {
	pub hub: RoomHub,
	pub dispatcher: Arc<Dispatcher>,
	pub settings: Arc<ConnectionSettings>,
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Inbound envelope limiter; disabled when either setting is 0.
#[derive(Debug)]
struct InboundRateLimiter {
	bucket: Option<TokenBucket>,
}

impl InboundRateLimiter {
	fn new(settings: &ConnectionSettings) -> Self {
		Self {
			bucket: TokenBucket::new(settings.rate_limit_burst, settings.rate_limit_per_minute),
		}
	}

	fn allow(&mut self) -> bool {
		match self.bucket.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
enum ReadExit {
	Shutdown,
	PeerClosed,
	DeadlineExpired,
	Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
enum WriteExit {
	Shutdown,
	QueueClosed,
	TimedOut,
	Failed(String),
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some(body.to_string()));
	*resp.status_mut() = status;
	resp
}

fn path_allowed(settings: &ConnectionSettings, path: &str) -> bool {
	match settings.upgrade_path.as_deref() {
		Some(expected) => path == expected,
		None => true,
	}
}

/// Run one client connection from handshake to teardown.
pub async fn handle_connection(conn_id: ConnId, stream: TcpStream, ctx: ConnectionContext) -> anyhow::Result<()> {
	let settings = ctx.settings.clone();

	let mut identity: Option<UserId> = None;
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		if !path_allowed(&settings, req.uri().path()) {
			return Err(error_response(StatusCode::NOT_FOUND, "not found"));
		}

		match settings.auth.identify(req.uri().query()) {
			Ok(user_id) => {
				identity = Some(user_id);
				Ok(resp)
			}
			Err(e) => {
				debug!(%conn_id, error = %e, "upgrade refused");
				Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"))
			}
		}
	};

	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(settings.max_message_bytes))
		.max_frame_size(Some(settings.max_message_bytes));

	let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
	let mut ws = match timeout(settings.keepalive.write_wait, handshake).await {
		Ok(Ok(ws)) => ws,
		Ok(Err(e)) => {
			metrics::counter!("parley_server_handshake_failures_total").increment(1);
			debug!(%conn_id, error = %e, "websocket handshake failed");
			return Ok(());
		}
		Err(_) => {
			metrics::counter!("parley_server_handshake_failures_total").increment(1);
			debug!(%conn_id, "websocket handshake timed out");
			return Ok(());
		}
	};

	let Some(user_id) = identity else {
		return Ok(());
	};

	let user = match ctx.dispatcher.store().get_user(user_id).await {
		Ok(Some(user)) => user,
		Ok(None) => {
			info!(%conn_id, %user_id, "unknown user, closing");
			let close = CloseFrame {
				code: CloseCode::Library(CLOSE_UNKNOWN_USER),
				reason: Utf8Bytes::from_static("unknown user"),
			};
			let _ = timeout(settings.keepalive.write_wait, ws.close(Some(close))).await;
			return Ok(());
		}
		Err(e) => {
			let close = CloseFrame {
				code: CloseCode::Error,
				reason: Utf8Bytes::from_static("internal error"),
			};
			let _ = timeout(settings.keepalive.write_wait, ws.close(Some(close))).await;
			return Err(anyhow::Error::new(e).context("load connecting user"));
		}
	};

	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(settings.outbound_queue_capacity.max(1));
	let shutdown = CancellationToken::new();
	ctx.hub
		.register(ConnectionHandle::new(conn_id, user.id, outbound_tx, shutdown.clone()))
		.await;
	info!(%conn_id, user_id = %user.id, username = %user.username, "connection registered");

	let (sink, mut stream) = ws.split();
	let writer = tokio::spawn(write_loop(sink, outbound_rx, shutdown.clone(), settings.keepalive));

	let mut session = Session::new(conn_id, &user);
	let read_exit = read_loop(&mut stream, &mut session, &ctx, &shutdown).await;

	shutdown.cancel();
	ctx.hub.unregister(conn_id).await;

	let write_exit = match writer.await {
		Ok(exit) => exit,
		Err(e) => WriteExit::Failed(format!("writer task panicked: {e}")),
	};

	match (&read_exit, &write_exit) {
		(ReadExit::Failed(_), _) | (_, WriteExit::Failed(_)) | (_, WriteExit::TimedOut) => {
			warn!(%conn_id, user_id = %user.id, read = ?read_exit, write = ?write_exit, "connection dropped")
		}
		_ => info!(%conn_id, user_id = %user.id, read = ?read_exit, write = ?write_exit, "connection closed"),
	}

	Ok(())
}

async fn read_loop<S>(
	stream: &mut S,
	session: &mut Session,
	ctx: &ConnectionContext,
	shutdown: &CancellationToken,
) -> ReadExit
where
	S: Stream<Item = Result<Message, WsError>> + Unpin,
{
	let settings = &ctx.settings;
	let mut deadline = ReadDeadline::new(settings.keepalive.pong_wait);
	let mut limiter = InboundRateLimiter::new(settings);

	loop {
		let next = tokio::select! {
			biased;
			_ = shutdown.cancelled() => return ReadExit::Shutdown,
			_ = deadline.elapsed() => return ReadExit::DeadlineExpired,
			next = stream.next() => next,
		};

		let msg = match next {
			None => return ReadExit::PeerClosed,
			Some(Err(e)) => return ReadExit::Failed(e.to_string()),
			Some(Ok(msg)) => msg,
		};

		// any inbound traffic, pongs included, proves liveness
		deadline.renew();

		let decoded = match &msg {
			Message::Text(text) => decode_envelope::<Inbound>(text.as_bytes(), settings.max_message_bytes),
			Message::Binary(data) => decode_envelope::<Inbound>(data, settings.max_message_bytes),
			Message::Close(_) => return ReadExit::PeerClosed,
			Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
		};
		metrics::counter!("parley_server_envelopes_in_total").increment(1);

		let envelope = match decoded {
			Ok(envelope) => envelope,
			Err(e) => {
				metrics::counter!("parley_server_decode_errors_total").increment(1);
				warn!(conn_id = %session.conn_id, user_id = %session.user_id, error = %e, "dropping malformed envelope");
				continue;
			}
		};

		if !limiter.allow() {
			metrics::counter!("parley_server_rate_limited_total").increment(1);
			debug!(conn_id = %session.conn_id, kind = envelope.kind(), "rate limited");
			ctx.hub.send_envelope(session.conn_id, &Outbound::error("rate limited")).await;
			continue;
		}

		ctx.dispatcher.dispatch(session, envelope).await;
	}
}

fn frame_message(frame: Frame) -> Option<Message> {
	match Utf8Bytes::try_from(frame.into_bytes()) {
		Ok(text) => Some(Message::Text(text)),
		Err(e) => {
			warn!(error = %e, "skipping non-utf8 outbound frame");
			None
		}
	}
}

/// Feed `first` plus whatever else is already queued, then flush once.
async fn write_batch<S>(sink: &mut S, rx: &mut mpsc::Receiver<Frame>, first: Frame) -> Result<usize, WsError>
where
	S: Sink<Message, Error = WsError> + Unpin,
{
	let mut written = 0usize;
	if let Some(msg) = frame_message(first) {
		sink.feed(msg).await?;
		written += 1;
	}

	while written < MAX_COALESCED_FRAMES {
		let Ok(frame) = rx.try_recv() else {
			break;
		};
		if let Some(msg) = frame_message(frame) {
			sink.feed(msg).await?;
			written += 1;
		}
	}

	sink.flush().await?;
	Ok(written)
}

async fn write_loop<S>(
	mut sink: S,
	mut rx: mpsc::Receiver<Frame>,
	shutdown: CancellationToken,
	keepalive: KeepaliveSettings,
) -> WriteExit
where
	S: Sink<Message, Error = WsError> + Unpin,
{
	let mut ticker = keepalive.ping_ticker();

	let exit = loop {
		tokio::select! {
			biased;
			_ = shutdown.cancelled() => break WriteExit::Shutdown,
			maybe = rx.recv() => {
				let Some(frame) = maybe else {
					break WriteExit::QueueClosed;
				};
				match timeout(keepalive.write_wait, write_batch(&mut sink, &mut rx, frame)).await {
					Ok(Ok(n)) => metrics::counter!("parley_server_envelopes_out_total").increment(n as u64),
					Ok(Err(e)) => break WriteExit::Failed(e.to_string()),
					Err(_) => break WriteExit::TimedOut,
				}
			}
			_ = ticker.tick() => {
				match timeout(keepalive.write_wait, sink.send(Message::Ping(Bytes::new()))).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => break WriteExit::Failed(e.to_string()),
					Err(_) => break WriteExit::TimedOut,
				}
			}
		}
	};

	// wake the read loop if the writer is the side that gave up
	shutdown.cancel();
	let _ = timeout(keepalive.write_wait, sink.close()).await;
	exit
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use futures::channel::mpsc as fmpsc;
	use parley_protocol::encode_envelope;

	use super::*;

	fn sink_pair() -> (
		impl Sink<Message, Error = WsError> + Unpin,
		fmpsc::UnboundedReceiver<Message>,
	) {
		let (tx, rx) = fmpsc::unbounded::<Message>();
		(tx.sink_map_err(|_| WsError::ConnectionClosed), rx)
	}

	#[test]
	fn token_bucket_allows_burst_then_refuses() {
		let mut limiter = InboundRateLimiter::new(&ConnectionSettings {
			rate_limit_burst: 2,
			rate_limit_per_minute: 1,
			..ConnectionSettings::default()
		});
		assert!(limiter.allow());
		assert!(limiter.allow());
		assert!(!limiter.allow());

		let mut open = InboundRateLimiter::new(&ConnectionSettings::default());
		assert!((0..1000).all(|_| open.allow()));
	}

	#[test]
	fn upgrade_path_filter() {
		let any = ConnectionSettings::default();
		assert!(path_allowed(&any, "/whatever"));

		let ws_only = ConnectionSettings {
			upgrade_path: Some("/ws".into()),
			..ConnectionSettings::default()
		};
		assert!(path_allowed(&ws_only, "/ws"));
		assert!(!path_allowed(&ws_only, "/"));
	}

	#[tokio::test]
	async fn writer_preserves_enqueue_order_and_stops_when_queue_closes() {
		let (sink, written) = sink_pair();
		let (tx, rx) = mpsc::channel::<Frame>(16);
		let shutdown = CancellationToken::new();

		for i in 0..5 {
			tx.send(encode_envelope(&Outbound::error(format!("e{i}"))).expect("encode"))
				.await
				.expect("queue");
		}
		drop(tx);

		let exit = write_loop(sink, rx, shutdown.clone(), KeepaliveSettings::default()).await;
		assert_eq!(exit, WriteExit::QueueClosed);
		assert!(shutdown.is_cancelled());

		let texts: Vec<String> = written
			.collect::<Vec<_>>()
			.await
			.into_iter()
			.filter_map(|msg| match msg {
				Message::Text(t) => Some(t.as_str().to_string()),
				_ => None,
			})
			.collect();
		assert_eq!(texts.len(), 5);
		for (i, text) in texts.iter().enumerate() {
			assert!(text.contains(&format!("\"e{i}\"")), "out of order at {i}: {text}");
		}
	}

	#[tokio::test]
	async fn writer_pings_when_idle() {
		let (sink, mut written) = sink_pair();
		let (_tx, rx) = mpsc::channel::<Frame>(4);
		let shutdown = CancellationToken::new();
		let keepalive = KeepaliveSettings {
			pong_wait: Duration::from_millis(50),
			write_wait: Duration::from_millis(50),
		};

		let task = tokio::spawn(write_loop(sink, rx, shutdown.clone(), keepalive));
		let first = tokio::time::timeout(Duration::from_secs(2), written.next())
			.await
			.expect("ping in time")
			.expect("message");
		assert!(matches!(first, Message::Ping(_)));

		shutdown.cancel();
		let exit = tokio::time::timeout(Duration::from_secs(2), task)
			.await
			.expect("writer stops")
			.expect("join");
		assert_eq!(exit, WriteExit::Shutdown);
	}
}
