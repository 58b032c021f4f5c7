#![forbid(unsafe_code)]

use std::future::Future;

use parley_domain::ConnId;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::connection::{ConnectionContext, handle_connection};

/// Accept connections until `shutdown` resolves. Each socket gets its own task.
pub async fn serve(listener: TcpListener, ctx: ConnectionContext, shutdown: impl Future<Output = ()>) {
	tokio::pin!(shutdown);
	let mut next_conn_id: u64 = 1;

	loop {
		let accepted = tokio::select! {
			_ = &mut shutdown => {
				info!("listener: shutdown requested, no longer accepting");
				break;
			}
			accepted = listener.accept() => accepted,
		};

		let (stream, remote) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				warn!(error = %e, "listener: accept failed");
				continue;
			}
		};

		let conn_id = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		if let Err(e) = stream.set_nodelay(true) {
			warn!(%conn_id, error = %e, "listener: failed to set TCP_NODELAY");
		}

		let ctx = ctx.clone();
		tokio::spawn(async move {
			info!(%conn_id, %remote, "accepted connection");
			if let Err(e) = handle_connection(conn_id, stream, ctx).await {
				warn!(%conn_id, error = %e, "connection ended with error");
			}
		});
	}
}
