use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::Lazy;
use rustls::ClientConfig;

use crate::transport::tls;

static SYSTEM_ROOT: Lazy<rustls_native_certs::CertificateResult> =
	Lazy::new(rustls_native_certs::load_native_certs);

/// Outbound TLS trust: system roots plus any pinned PEM authorities. Shared
/// by the origin client, the CAS client, and the WebSocket bridge.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
	pub config: Arc<ClientConfig>,
}

impl TrustPolicy {
	pub fn load(authorities: &[PathBuf]) -> anyhow::Result<TrustPolicy> {
		let mut roots = rustls::RootCertStore::empty();
		for cert in &SYSTEM_ROOT.certs {
			let _ = roots.add(cert.clone());
		}
		for path in authorities {
			let pem = fs_err::read(path)?;
			let mut reader = std::io::BufReader::new(Cursor::new(pem));
			let certs = rustls_pemfile::certs(&mut reader)
				.collect::<Result<Vec<_>, _>>()
				.with_context(|| format!("failed to parse CA bundle {}", path.display()))?;
			let (added, _) = roots.add_parsable_certificates(certs);
			if added == 0 {
				anyhow::bail!("no usable certificates in CA bundle {}", path.display());
			}
		}

		let mut config = ClientConfig::builder_with_provider(tls::provider())
			.with_protocol_versions(tls::ALL_TLS_VERSIONS)
			.expect("client config must be valid")
			.with_root_certificates(Arc::new(roots))
			.with_no_client_auth();
		// Origin and CAS traffic stays HTTP/1.1; upgrades cannot ride h2.
		config.alpn_protocols = vec![b"http/1.1".into()];
		Ok(TrustPolicy {
			config: Arc::new(config),
		})
	}
}
