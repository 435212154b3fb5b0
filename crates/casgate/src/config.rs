use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use url::Url;

use crate::cas::CasInfo;
use crate::http::HeaderName;
use crate::http::rewrite::UrlPattern;

/// Everything the proxy needs to run. Immutable after startup.
#[derive(Debug)]
pub struct Config {
	pub listen: ListenEndpoint,
	pub origin: Origin,
	pub cas: CasInfo,
	pub identity: ProxyIdentity,
	pub excluded_resources: Vec<String>,
	pub excluded_branches: Vec<String>,
	pub logout_patterns: Vec<UrlPattern>,
	pub logout_passthrough: bool,
	pub auth_info_resource: Option<String>,
	pub remote_user_header: HeaderName,
	pub logout_instant_skew: Duration,
	pub session_ttl: Duration,
	pub authorities: Vec<PathBuf>,
	pub origin_endpoint: Option<EndpointAddr>,
	pub cas_endpoint: Option<EndpointAddr>,
}

pub const DEFAULT_LOGOUT_INSTANT_SKEW: Duration = Duration::from_secs(5);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(900);

/// The listening side of the proxy, parsed from an endpoint descriptor such
/// as `tcp:8080` or `ssl:8443:privateKey=server.key:certKey=server.crt`.
#[derive(Debug, Clone)]
pub enum ListenEndpoint {
	Tcp {
		port: u16,
	},
	Tls {
		port: u16,
		private_key: PathBuf,
		cert: PathBuf,
	},
}

impl ListenEndpoint {
	pub fn port(&self) -> u16 {
		match self {
			ListenEndpoint::Tcp { port } => *port,
			ListenEndpoint::Tls { port, .. } => *port,
		}
	}

	pub fn is_tls(&self) -> bool {
		matches!(self, ListenEndpoint::Tls { .. })
	}
}

impl FromStr for ListenEndpoint {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split(':');
		let kind = parts.next().unwrap_or_default();
		let port: u16 = parts
			.next()
			.ok_or_else(|| anyhow!("endpoint '{s}' is missing a port"))?
			.parse()
			.with_context(|| format!("endpoint '{s}' has an invalid port"))?;
		match kind {
			"tcp" => Ok(ListenEndpoint::Tcp { port }),
			"ssl" => {
				let mut private_key = None;
				let mut cert = None;
				for opt in parts {
					match opt.split_once('=') {
						Some(("privateKey", v)) => private_key = Some(PathBuf::from(v)),
						Some(("certKey", v)) => cert = Some(PathBuf::from(v)),
						_ => bail!("unknown option '{opt}' in endpoint '{s}'"),
					}
				}
				Ok(ListenEndpoint::Tls {
					port,
					private_key: private_key.ok_or_else(|| anyhow!("ssl endpoint requires privateKey="))?,
					cert: cert.ok_or_else(|| anyhow!("ssl endpoint requires certKey="))?,
				})
			},
			other => bail!("unsupported endpoint type '{other}'"),
		}
	}
}

/// An outbound endpoint descriptor: `tcp:host=H:port=P` or `ssl:host=H:port=P`.
/// Used to pin a client to a fixed address and to key the WebSocket bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
	pub tls: bool,
	pub host: String,
	pub port: u16,
}

impl fmt::Display for EndpointAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let kind = if self.tls { "ssl" } else { "tcp" };
		write!(f, "{}:host={}:port={}", kind, self.host, self.port)
	}
}

impl FromStr for EndpointAddr {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut parts = s.split(':');
		let tls = match parts.next().unwrap_or_default() {
			"tcp" => false,
			"ssl" => true,
			other => bail!("unsupported client endpoint type '{other}'"),
		};
		let mut host = None;
		let mut port = None;
		for opt in parts {
			match opt.split_once('=') {
				Some(("host", v)) => host = Some(v.to_string()),
				Some(("port", v)) => {
					port = Some(
						v.parse::<u16>()
							.with_context(|| format!("invalid port in endpoint '{s}'"))?,
					)
				},
				_ => bail!("unknown option '{opt}' in endpoint '{s}'"),
			}
		}
		Ok(EndpointAddr {
			tls,
			host: host.ok_or_else(|| anyhow!("client endpoint requires host="))?,
			port: port.ok_or_else(|| anyhow!("client endpoint requires port="))?,
		})
	}
}

/// The proxied origin, split once at startup. `path` is the mount prefix
/// under which the origin lives; it never carries a trailing slash.
#[derive(Debug, Clone)]
pub struct Origin {
	pub scheme: String,
	pub netloc: String,
	pub host: String,
	pub port: Option<u16>,
	pub path: String,
}

impl Origin {
	pub fn parse(raw: &str) -> anyhow::Result<Origin> {
		let raw = raw.strip_suffix('/').unwrap_or(raw);
		let url = Url::parse(raw).with_context(|| format!("invalid origin URL '{raw}'"))?;
		let scheme = url.scheme().to_string();
		if scheme != "http" && scheme != "https" {
			bail!("origin URL must be http or https, got '{scheme}'");
		}
		let host = url
			.host_str()
			.ok_or_else(|| anyhow!("origin URL '{raw}' has no host"))?
			.to_string();
		let port = url.port();
		let netloc = match port {
			Some(p) => format!("{host}:{p}"),
			None => host.clone(),
		};
		let path = match url.path() {
			"/" => String::new(),
			p => p.to_string(),
		};
		Ok(Origin {
			scheme,
			netloc,
			host,
			port,
			path,
		})
	}

	pub fn is_https(&self) -> bool {
		self.scheme == "https"
	}

	/// The full origin base URL, without a trailing slash. Outbound request
	/// URLs are this plus the raw inbound request URI.
	pub fn base(&self) -> String {
		format!("{}://{}{}", self.scheme, self.netloc, self.path)
	}

	/// Effective origin port, defaulted by scheme.
	pub fn effective_port(&self) -> u16 {
		self
			.port
			.unwrap_or(if self.is_https() { 443 } else { 80 })
	}

	/// The endpoint descriptor a WebSocket upgrade for this origin tunnels to.
	pub fn websocket_endpoint(&self) -> EndpointAddr {
		EndpointAddr {
			tls: self.is_https(),
			host: self.host.clone(),
			port: self.effective_port(),
		}
	}
}

/// How the proxy is reachable from the outside; used to synthesize the CAS
/// `service` URL and to rewrite origin-side URLs back into proxy-space.
#[derive(Debug, Clone)]
pub struct ProxyIdentity {
	pub fqdn: String,
	pub port: u16,
	pub is_https: bool,
}

impl ProxyIdentity {
	pub fn scheme(&self) -> &'static str {
		if self.is_https { "https" } else { "http" }
	}

	fn default_port(&self) -> u16 {
		if self.is_https { 443 } else { 80 }
	}

	/// External base URL, omitting the default port for the scheme.
	pub fn external_base(&self) -> String {
		if self.port == self.default_port() {
			format!("{}://{}", self.scheme(), self.fqdn)
		} else {
			format!("{}://{}:{}", self.scheme(), self.fqdn, self.port)
		}
	}

	/// Like `external_base`, but in ws/wss space for upgrade requests.
	pub fn websocket_base(&self) -> String {
		let scheme = if self.is_https { "wss" } else { "ws" };
		if self.port == self.default_port() {
			format!("{scheme}://{}", self.fqdn)
		} else {
			format!("{scheme}://{}:{}", self.fqdn, self.port)
		}
	}
}

/// The FQDN used when none is configured explicitly.
pub fn system_fqdn() -> String {
	hostname::get()
		.ok()
		.and_then(|h| h.into_string().ok())
		.unwrap_or_else(|| "localhost".to_string())
}
