use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::crypto::CryptoProvider;
use rustls::{ServerConfig, version};

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&version::TLS13, &version::TLS12];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side TLS for an `ssl:` listening endpoint.
pub fn server_config(private_key: &Path, cert: &Path) -> anyhow::Result<Arc<ServerConfig>> {
	let pem = fs_err::read(cert)?;
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let cert_chain = rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("failed to parse certificate {}", cert.display()))?;

	let pem = fs_err::read(private_key)?;
	let mut reader = std::io::BufReader::new(Cursor::new(pem));
	let key = rustls_pemfile::private_key(&mut reader)
		.with_context(|| format!("failed to parse private key {}", private_key.display()))?
		.ok_or_else(|| anyhow::anyhow!("no private key in {}", private_key.display()))?;

	let mut config = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("server config must be valid")
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)?;
	config.alpn_protocols = vec![b"http/1.1".into()];
	Ok(Arc::new(config))
}
