#![forbid(unsafe_code)]

mod config;
mod server;
mod store;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use parley_domain::UserId;
use parley_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::auth::{UpgradeAuth, issue_hmac_token};
use crate::server::connection::{ConnectionContext, ConnectionSettings};
use crate::server::dispatcher::{DispatchSettings, Dispatcher};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::keepalive::KeepaliveSettings;
use crate::server::listener::serve;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::store::{ChatStore, MemoryStore, SqliteStore};

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

struct Args {
	bind: WsEndpoint,
	config_path: Option<PathBuf>,
	mint_token: Option<UserId>,
	ttl_secs: u64,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port[/path]] [--config <path>]\n\
       parley_server --mint-token <user_id> [--ttl-secs N]\n\
\n\
Options:\n\
\t--bind        Bind endpoint (default: ws://127.0.0.1:8080/ws)\n\
\t             Format: ws://host:port[/path]\n\
\t--config      Config file (default: ~/.parley/config.toml)\n\
\t--mint-token  Print an access token for <user_id> and exit\n\
\t--ttl-secs    Token lifetime for --mint-token (default: 86400)\n\
\t--help        Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut bind_endpoint = "ws://127.0.0.1:8080/ws".to_string();
	let mut config_path = None;
	let mut mint_token = None;
	let mut ttl_secs = DEFAULT_TOKEN_TTL_SECS;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--mint-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let user_id = v.parse::<UserId>().unwrap_or_else(|e| {
					eprintln!("--mint-token: {e}");
					usage_and_exit();
				});
				mint_token = Some(user_id);
			}
			"--ttl-secs" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				ttl_secs = v.trim().parse().unwrap_or_else(|_| {
					eprintln!("--ttl-secs must be a positive integer");
					usage_and_exit();
				});
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		mint_token,
		ttl_secs,
	}
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// In-memory store seeded with `name#tag` users and a shared lobby room.
async fn seeded_memory_store(seed_users: &[String]) -> anyhow::Result<MemoryStore> {
	let store = MemoryStore::new();

	let mut users = Vec::with_capacity(seed_users.len());
	for handle in seed_users {
		let Some((username, tag)) = handle.rsplit_once('#') else {
			warn!(%handle, "seed user ignored (expected name#tag)");
			continue;
		};
		let user = store.insert_user(username.trim(), tag.trim()).await?;
		info!(user_id = %user.id, handle = %user.handle(), "seeded user");
		users.push(user);
	}

	if let Some((owner, rest)) = users.split_first() {
		let lobby = store.insert_room("lobby", owner.id).await?;
		for user in rest {
			store.create_room_membership(lobby.id, user.id).await?;
		}
		info!(room_id = %lobby.id, members = users.len(), "seeded lobby room");
	}

	Ok(store)
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};
		let store = SqliteStore::connect(database_url).await?;
		info!("chat store: sqlite");
		return Ok(Arc::new(store));
	}

	let store = seeded_memory_store(&cfg.persistence.seed_users).await?;
	warn!("chat store: in-memory (nothing survives a restart)");
	Ok(Arc::new(store))
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c");
		std::future::pending::<()>().await;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};

	if let Some(user_id) = args.mint_token {
		let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
		let Some(secret) = server_cfg.server.auth_hmac_secret.as_ref() else {
			return Err(anyhow!("--mint-token requires server.auth_hmac_secret"));
		};
		println!("{}", issue_hmac_token(user_id, args.ttl_secs, secret.expose())?);
		return Ok(());
	}

	init_tracing();

	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	if server_cfg.server.auth_hmac_secret.is_none() {
		if server_cfg.server.allow_insecure_user_id {
			warn!("server auth: no auth_hmac_secret; trusting ?user_id= on upgrade (development only)");
		} else {
			warn!("server auth: no auth_hmac_secret and insecure user ids disabled; every upgrade will be refused");
		}
	}

	let store = open_store(&server_cfg).await?;

	let hub = RoomHub::spawn(RoomHubConfig {
		command_channel_capacity: server_cfg.server.hub_command_capacity,
		debug_logs: true,
	});

	let health_state = HealthState::new(hub.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let dispatcher = Arc::new(Dispatcher::new(
		store,
		hub.clone(),
		DispatchSettings {
			join_requires_membership: server_cfg.server.join_requires_membership,
		},
	));

	let settings = ConnectionSettings {
		max_message_bytes: server_cfg.server.max_message_bytes,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		keepalive: KeepaliveSettings {
			pong_wait: server_cfg.server.pong_wait,
			write_wait: server_cfg.server.write_wait,
		},
		auth: UpgradeAuth {
			hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
			allow_insecure_user_id: server_cfg.server.allow_insecure_user_id,
		},
		upgrade_path: args.bind.path.clone(),
		rate_limit_burst: server_cfg.server.rate_limit_burst,
		rate_limit_per_minute: server_cfg.server.rate_limit_per_minute,
	};

	let bind_addr = args.bind.to_socket_addr_if_ip_literal().map_err(|e| anyhow!(e))?;
	let listener = TcpListener::bind(bind_addr).await?;
	info!(
		bind = %listener.local_addr()?,
		path = args.bind.path.as_deref().unwrap_or("*"),
		"parley_server: websocket listener ready"
	);
	health_state.mark_ready();

	let ctx = ConnectionContext {
		hub,
		dispatcher,
		settings: Arc::new(settings),
	};
	serve(listener, ctx, shutdown_signal()).await;

	info!("parley_server: stopped");
	Ok(())
}
