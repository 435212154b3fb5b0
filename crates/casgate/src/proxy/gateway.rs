use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ProxyInputs;
use crate::config::ListenEndpoint;
use crate::proxy::httpproxy::CasProxy;
use crate::transport::tls;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Owns the listening socket: accepts connections, terminates TLS when the
/// endpoint asks for it, and serves each connection until a shutdown signal
/// drains them.
pub struct Gateway {
	inputs: Arc<ProxyInputs>,
	shutdown: watch::Receiver<()>,
}

impl Gateway {
	pub fn new(inputs: Arc<ProxyInputs>, shutdown: watch::Receiver<()>) -> Gateway {
		Gateway { inputs, shutdown }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let cfg = self.inputs.cfg.clone();
		let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen.port()));
		let listener = TcpListener::bind(addr).await?;
		let tls_config = match &cfg.listen {
			ListenEndpoint::Tls {
				private_key, cert, ..
			} => Some(tls::server_config(private_key, cert)?),
			ListenEndpoint::Tcp { .. } => None,
		};
		info!(
			%addr,
			tls = tls_config.is_some(),
			origin = cfg.origin.base(),
			"listening"
		);

		let proxy = CasProxy {
			inputs: self.inputs.clone(),
		};
		// Every connection task holds a clone of `done_tx`; once the accept
		// loop drops the original, recv() resolves when the last task ends.
		let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
		let mut shutdown = self.shutdown;
		loop {
			tokio::select! {
				res = listener.accept() => {
					let (stream, peer) = match res {
						Ok(accepted) => accepted,
						Err(e) => {
							warn!("accept failed: {e}");
							continue;
						},
					};
					debug!(%peer, "connection opened");
					serve_connection(
						stream,
						proxy.clone(),
						tls_config.clone(),
						shutdown.clone(),
						done_tx.clone(),
					);
				}
				_ = shutdown.changed() => {
					info!("shutdown signal received; draining connections");
					break;
				}
			}
		}
		drop(done_tx);
		tokio::select! {
			_ = done_rx.recv() => info!("connections drained"),
			_ = tokio::time::sleep(DRAIN_DEADLINE) => {
				warn!("drain deadline passed; abandoning open connections");
			},
		}
		Ok(())
	}
}

fn serve_connection(
	stream: TcpStream,
	proxy: CasProxy,
	tls_config: Option<Arc<ServerConfig>>,
	mut shutdown: watch::Receiver<()>,
	done: mpsc::Sender<()>,
) {
	let secure = tls_config.is_some();
	let service = hyper::service::service_fn(move |req| {
		let proxy = proxy.clone();
		async move { Ok::<_, Infallible>(proxy.proxy(req, secure).await) }
	});
	tokio::spawn(async move {
		let _done = done;
		let server = auto_server();
		let result = match tls_config {
			None => {
				let conn = server.serve_connection_with_upgrades(TokioIo::new(stream), service);
				tokio::pin!(conn);
				tokio::select! {
					res = conn.as_mut() => res,
					_ = shutdown.changed() => {
						// Sends GOAWAY / Connection: close, then lets
						// in-flight exchanges finish.
						conn.as_mut().graceful_shutdown();
						conn.await
					},
				}
			},
			Some(tls_config) => {
				let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
				let tls_stream = match acceptor.accept(stream).await {
					Ok(s) => s,
					Err(e) => {
						warn!("TLS handshake failed: {e}");
						return;
					},
				};
				let conn = server.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
				tokio::pin!(conn);
				tokio::select! {
					res = conn.as_mut() => res,
					_ = shutdown.changed() => {
						conn.as_mut().graceful_shutdown();
						conn.await
					},
				}
			},
		};
		if let Err(e) = result {
			debug!("connection closed: {e}");
		}
	});
}

fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http2().timer(TokioTimer::new());
	b
}
