pub mod attr_check;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::http::{HeaderMap, Method, Request, Response};
use crate::session::Attributes;

/// Handed to info-acceptor plugins once the external identity is known.
pub struct ProxyInfo {
	pub fqdn: String,
	pub port: u16,
	pub is_https: bool,
	pub origin_scheme: String,
	pub origin_netloc: String,
	pub origin_path: String,
	/// Lets a plugin force-destroy a session by id.
	pub expire_session: Arc<dyn Fn(&str) + Send + Sync>,
}

pub trait InfoAcceptor: Send + Sync {
	fn on_info_set(&self, info: &ProxyInfo);
}

/// May rewrite the service URL before the user-agent is sent to CAS login.
#[async_trait]
pub trait CasRedirectHandler: Send + Sync {
	fn priority(&self) -> i32 {
		0
	}
	async fn intercept_service_url(
		&self,
		service_url: String,
		req: &::http::request::Parts,
	) -> String;
}

/// May take full ownership of a request before it is forwarded to the origin.
#[async_trait]
pub trait ResourceInterceptor: Send + Sync {
	fn priority(&self) -> i32 {
		0
	}
	fn claims(&self, url: &str, method: &Method, headers: &HeaderMap) -> bool;
	async fn handle(&self, url: &str, req: Request) -> anyhow::Result<Response>;
}

/// Consulted after a ticket validates; any denial turns into a 403.
pub trait AccessControl: Send + Sync {
	fn priority(&self) -> i32 {
		0
	}
	fn tag(&self) -> &'static str;
	fn is_allowed(&self, username: &str, attributes: &Attributes) -> Result<(), String>;
}

/// Transforms response bodies on their way back to the user-agent.
#[async_trait]
pub trait ContentModifier: Send + Sync {
	fn priority(&self) -> i32 {
		0
	}
	async fn transform(&self, body: Bytes, req: &::http::request::Parts) -> anyhow::Result<Bytes>;
}

/// The hooks one `--plugin` instantiation advertises; any subset.
#[derive(Default)]
pub struct PluginHandle {
	pub info_acceptor: Option<Arc<dyn InfoAcceptor>>,
	pub cas_redirect: Option<Arc<dyn CasRedirectHandler>>,
	pub interceptor: Option<Arc<dyn ResourceInterceptor>>,
	pub access_control: Option<Arc<dyn AccessControl>>,
	pub content_modifier: Option<Arc<dyn ContentModifier>>,
	/// `(mount, directory)` advertisement; serving is wired up elsewhere.
	pub static_resource: Option<(String, PathBuf)>,
}

/// Per-hook registries, each sorted ascending by plugin priority.
/// Immutable after startup.
#[derive(Default)]
pub struct PluginSet {
	pub info_acceptors: Vec<Arc<dyn InfoAcceptor>>,
	pub cas_redirects: Vec<Arc<dyn CasRedirectHandler>>,
	pub interceptors: Vec<Arc<dyn ResourceInterceptor>>,
	pub access_controls: Vec<Arc<dyn AccessControl>>,
	pub content_modifiers: Vec<Arc<dyn ContentModifier>>,
	pub static_mounts: HashMap<String, PathBuf>,
}

impl PluginSet {
	pub fn build(handles: Vec<PluginHandle>) -> anyhow::Result<PluginSet> {
		let mut set = PluginSet::default();
		for handle in handles {
			if let Some(p) = handle.info_acceptor {
				set.info_acceptors.push(p);
			}
			if let Some(p) = handle.cas_redirect {
				set.cas_redirects.push(p);
			}
			if let Some(p) = handle.interceptor {
				set.interceptors.push(p);
			}
			if let Some(p) = handle.access_control {
				set.access_controls.push(p);
			}
			if let Some(p) = handle.content_modifier {
				set.content_modifiers.push(p);
			}
			if let Some((mount, dir)) = handle.static_resource {
				match set.static_mounts.get(&mount) {
					Some(existing) if existing != &dir => {
						anyhow::bail!(
							"static resource conflict for '{mount}': {} != {}",
							existing.display(),
							dir.display()
						);
					},
					_ => {
						set.static_mounts.insert(mount, dir);
					},
				}
			}
		}
		// sort_by_key is stable, so equal priorities keep registration order
		set.cas_redirects.sort_by_key(|p| p.priority());
		set.interceptors.sort_by_key(|p| p.priority());
		set.access_controls.sort_by_key(|p| p.priority());
		set.content_modifiers.sort_by_key(|p| p.priority());
		Ok(set)
	}

	pub fn notify_info(&self, info: &ProxyInfo) {
		for acceptor in &self.info_acceptors {
			acceptor.on_info_set(info);
		}
	}
}

/// A registered plugin kind: `--plugin tag[:args]` instantiates through here.
#[derive(Clone, Copy)]
pub struct PluginFactory {
	pub tag: &'static str,
	pub usage: &'static str,
	pub build: fn(&str) -> anyhow::Result<PluginHandle>,
}

/// Every plugin kind this binary knows how to construct.
static REGISTRY: [PluginFactory; 1] = [attr_check::FACTORY];

pub fn registry() -> &'static [PluginFactory] {
	&REGISTRY
}
