use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use casgate::cas::{self, CasInfo};
use casgate::config::{
	Config, DEFAULT_LOGOUT_INSTANT_SKEW, DEFAULT_SESSION_TTL, EndpointAddr, ListenEndpoint, Origin,
	ProxyIdentity, system_fqdn,
};
use casgate::http::HeaderName;
use casgate::http::rewrite::UrlPattern;
use casgate::plugins::{self, PluginHandle};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// CAS authenticating reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "casgate", about, long_about = None)]
struct Args {
	/// Listening endpoint descriptor, e.g. tcp:8080 or
	/// ssl:8443:privateKey=key.pem:certKey=cert.pem
	#[arg(short, long, value_name = "endpoint")]
	endpoint: Option<String>,

	/// The base URL to proxy
	#[arg(short, long = "proxied-url", value_name = "url")]
	proxied_url: Option<String>,

	/// The CAS /login URL
	#[arg(short, long = "cas-login", value_name = "url")]
	cas_login: Option<String>,

	/// The CAS /serviceValidate URL; defaults to the login URL with its last
	/// path segment replaced
	#[arg(short = 's', long = "cas-service-validate", value_name = "url")]
	cas_service_validate: Option<String>,

	/// The CAS /logout URL users are sent to after a logout pattern matches
	#[arg(long = "cas-logout", value_name = "url")]
	cas_logout: Option<String>,

	/// Explicitly specify the FQDN that should be included in URL callbacks
	#[arg(long, value_name = "fqdn")]
	fqdn: Option<String>,

	/// Add a trusted CA public cert (PEM format); repeatable
	#[arg(long = "addCA", value_name = "path")]
	add_ca: Vec<PathBuf>,

	/// Include a plugin as tag[:args]; repeatable
	#[arg(long = "plugin", value_name = "tag[:args]")]
	plugin: Vec<String>,

	/// Print the available plugins and exit
	#[arg(long = "help-plugins")]
	help_plugins: bool,

	/// Exact request path to pass through unauthenticated; repeatable
	#[arg(long = "exclude", value_name = "path")]
	exclude: Vec<String>,

	/// Path prefix to pass through unauthenticated; repeatable
	#[arg(long = "exclude-branch", value_name = "path")]
	exclude_branch: Vec<String>,

	/// Relative URL glob that destroys the session when matched; repeatable
	#[arg(long = "logout-pattern", value_name = "glob")]
	logout_pattern: Vec<String>,

	/// On a logout match, also forward the request to the origin
	#[arg(long = "logout-passthrough")]
	logout_passthrough: bool,

	/// Path that serves the authenticated user's identity as JSON
	#[arg(long = "auth-info-resource", value_name = "path")]
	auth_info_resource: Option<String>,

	/// Header carrying the authenticated username to the origin
	#[arg(long = "remote-user-header", value_name = "name", default_value = "Remote-User")]
	remote_user_header: String,

	/// Idle session lifetime in seconds
	#[arg(
		long = "session-ttl",
		value_name = "seconds",
		default_value_t = DEFAULT_SESSION_TTL.as_secs()
	)]
	session_ttl: u64,

	/// Pin the origin-bound client to an endpoint, e.g. tcp:host=10.0.0.2:port=8081
	#[arg(long = "proxy-client-endpoint", value_name = "endpoint")]
	proxy_client_endpoint: Option<String>,

	/// Pin the CAS-bound client to an endpoint
	#[arg(long = "cas-client-endpoint", value_name = "endpoint")]
	cas_client_endpoint: Option<String>,

	/// Log the full proxying trace
	#[arg(short, long)]
	verbose: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_logging(args.verbose);

	if args.help_plugins {
		print_plugin_help(&mut std::io::stderr().lock())?;
		return Ok(());
	}

	let plugins = instantiate_plugins(&args.plugin)?;
	let config = build_config(&args)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("failed to build tokio runtime")?
		.block_on(casgate::app::run(config, plugins))
}

fn init_logging(verbose: bool) {
	let default = if verbose { "casgate=debug,info" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
		)
		.init();
}

fn print_plugin_help(out: &mut impl Write) -> anyhow::Result<()> {
	let registry = plugins::registry();
	let width = registry
		.iter()
		.map(|f| f.tag.len())
		.chain(["Plugin".len()])
		.max()
		.unwrap_or(0);
	writeln!(out, "  {:width$}\t{}", "Plugin", "ArgString format")?;
	writeln!(out, "  {:width$}\t{}", "======", "================")?;
	for factory in registry {
		writeln!(out, "  {:width$}\t{}", factory.tag, factory.usage)?;
	}
	writeln!(out)?;
	Ok(())
}

fn instantiate_plugins(args: &[String]) -> anyhow::Result<Vec<PluginHandle>> {
	let registry = plugins::registry();
	let mut bad_tags: Vec<&str> = Vec::new();
	let mut handles = Vec::new();
	for arg in args {
		let (tag, plugin_args) = match arg.split_once(':') {
			Some((tag, rest)) => (tag, rest),
			None => (arg.as_str(), ""),
		};
		match registry.iter().find(|f| f.tag == tag) {
			Some(factory) => {
				let handle = (factory.build)(plugin_args)
					.with_context(|| format!("failed to instantiate plugin '{arg}'"))?;
				handles.push(handle);
			},
			None => bad_tags.push(tag),
		}
	}
	if !bad_tags.is_empty() {
		bad_tags.sort_unstable();
		bail!("the following plugins are not valid: {}", bad_tags.join(", "));
	}
	Ok(handles)
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
	let endpoint = args
		.endpoint
		.as_deref()
		.context("must specify a connection endpoint")?;
	let proxied_url = args
		.proxied_url
		.as_deref()
		.context("must specify base URL to proxy")?;
	let cas_login = args
		.cas_login
		.as_deref()
		.context("must specify CAS login URL")?;

	let listen: ListenEndpoint = endpoint.parse()?;
	let origin = Origin::parse(proxied_url)?;
	let login_url =
		url::Url::parse(cas_login).with_context(|| format!("invalid CAS login URL '{cas_login}'"))?;
	let service_validate_url = match &args.cas_service_validate {
		Some(raw) => url::Url::parse(raw).with_context(|| format!("invalid CAS URL '{raw}'"))?,
		None => cas::derive_service_validate(&login_url)?,
	};
	let logout_url = args
		.cas_logout
		.as_deref()
		.map(url::Url::parse)
		.transpose()
		.context("invalid CAS logout URL")?;

	let logout_patterns = args
		.logout_pattern
		.iter()
		.map(|p| UrlPattern::parse(p))
		.collect::<anyhow::Result<Vec<_>>>()?;

	let remote_user_header: HeaderName = args
		.remote_user_header
		.parse()
		.with_context(|| format!("invalid header name '{}'", args.remote_user_header))?;

	let identity = ProxyIdentity {
		fqdn: args.fqdn.clone().unwrap_or_else(system_fqdn),
		port: listen.port(),
		is_https: listen.is_tls(),
	};

	Ok(Config {
		listen,
		origin,
		cas: CasInfo {
			login_url,
			service_validate_url,
			logout_url,
		},
		identity,
		excluded_resources: args.exclude.clone(),
		excluded_branches: args.exclude_branch.clone(),
		logout_patterns,
		logout_passthrough: args.logout_passthrough,
		auth_info_resource: args.auth_info_resource.clone(),
		remote_user_header,
		logout_instant_skew: DEFAULT_LOGOUT_INSTANT_SKEW,
		session_ttl: Duration::from_secs(args.session_ttl),
		authorities: args.add_ca.clone(),
		origin_endpoint: parse_endpoint(&args.proxy_client_endpoint)?,
		cas_endpoint: parse_endpoint(&args.cas_client_endpoint)?,
	})
}

fn parse_endpoint(raw: &Option<String>) -> anyhow::Result<Option<EndpointAddr>> {
	raw.as_deref().map(str::parse).transpose()
}
