pub mod app;
pub mod cas;
pub mod client;
pub mod config;
pub mod http;
pub mod plugins;
pub mod proxy;
pub mod session;
pub mod transport;

use std::sync::Arc;

use client::Client;
use config::Config;
use plugins::PluginSet;
use session::SessionStore;

/// Everything a request handler needs, shared across all connections.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub sessions: Arc<SessionStore>,
	pub plugins: Arc<PluginSet>,
	/// Pooled client for proxied origin traffic.
	pub origin: Client,
	/// Pooled client for CAS back-channel validation. Never shared with
	/// origin or inbound connections.
	pub cas: Client,
}
