use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::ProxyInputs;
use crate::client::Client;
use crate::config::Config;
use crate::http::trust::TrustPolicy;
use crate::plugins::{PluginHandle, PluginSet, ProxyInfo};
use crate::proxy::Gateway;
use crate::session::{AuthInfoCallback, SessionStore};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Wire everything together and serve until a shutdown signal arrives.
pub async fn run(cfg: Config, handles: Vec<PluginHandle>) -> anyhow::Result<()> {
	run_with_auth_info(cfg, handles, None).await
}

/// Like [`run`], with an optional callback observing session establishment
/// and teardown.
pub async fn run_with_auth_info(
	cfg: Config,
	handles: Vec<PluginHandle>,
	auth_info: Option<AuthInfoCallback>,
) -> anyhow::Result<()> {
	let cfg = Arc::new(cfg);
	let plugins = Arc::new(PluginSet::build(handles)?);
	let trust = TrustPolicy::load(&cfg.authorities)?;
	let origin = Client::new("origin", trust.clone(), cfg.origin_endpoint.clone());
	let cas = Client::new("cas", trust, cfg.cas_endpoint.clone());
	let sessions = match auth_info {
		Some(cb) => SessionStore::with_auth_info_callback(cfg.session_ttl, cb),
		None => SessionStore::new(cfg.session_ttl),
	};

	for (mount, dir) in &plugins.static_mounts {
		// Serving static trees is delegated; we only validate and announce.
		info!(mount, dir = %dir.display(), "static resource mount advertised");
	}
	{
		let expire_sessions = sessions.clone();
		let info = ProxyInfo {
			fqdn: cfg.identity.fqdn.clone(),
			port: cfg.identity.port,
			is_https: cfg.identity.is_https,
			origin_scheme: cfg.origin.scheme.clone(),
			origin_netloc: cfg.origin.netloc.clone(),
			origin_path: cfg.origin.path.clone(),
			expire_session: Arc::new(move |session_id| {
				expire_sessions.destroy(session_id);
			}),
		};
		plugins.notify_info(&info);
	}
	tokio::spawn(sessions.clone().run_expiry(EXPIRY_SWEEP_INTERVAL));

	let (shutdown_tx, shutdown_rx) = watch::channel(());
	tokio::spawn(async move {
		wait_for_signal().await;
		let _ = shutdown_tx.send(());
	});

	let inputs = Arc::new(ProxyInputs {
		cfg,
		sessions,
		plugins,
		origin,
		cas,
	});
	Gateway::new(inputs, shutdown_rx).run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(s) => s,
		Err(e) => {
			debug!("failed to register SIGTERM handler: {e}");
			let _ = tokio::signal::ctrl_c().await;
			return;
		},
	};
	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("received SIGINT, starting shutdown"),
		_ = sigterm.recv() => info!("received SIGTERM, starting shutdown"),
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received ctrl-c, starting shutdown");
}
