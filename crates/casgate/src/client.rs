use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, event};

use crate::config::EndpointAddr;
use crate::http::trust::TrustPolicy;
use crate::http::{Body, Scheme, Uri};
use crate::proxy::ProxyError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// A pooled outbound HTTP client. The proxy runs two: one bound to the
/// origin, one to CAS, so back-channel and proxied traffic never share
/// connections. Redirects are surfaced, never followed.
#[derive(Clone)]
pub struct Client {
	name: &'static str,
	client: hyper_util::client::legacy::Client<Connector, Body>,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").field("name", &self.name).finish()
	}
}

impl Client {
	/// `pinned` overrides where connections are dialed while the request URI
	/// still provides the TLS server name.
	pub fn new(name: &'static str, trust: TrustPolicy, pinned: Option<EndpointAddr>) -> Client {
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.timer(TokioTimer::new())
			.pool_timer(TokioTimer::new())
			.pool_idle_timeout(POOL_IDLE_TIMEOUT)
			.pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
			.build(Connector { trust, pinned });
		Client { name, client }
	}

	pub async fn request(&self, req: crate::http::Request) -> Result<crate::http::Response, ProxyError> {
		let start = Instant::now();
		if req.uri().scheme().is_none() || req.uri().authority().is_none() {
			return Err(ProxyError::Processing(anyhow::anyhow!(
				"outbound request URI must be absolute, got {}",
				req.uri()
			)));
		}
		let method = req.method().clone();
		let uri = req.uri().clone();
		let resp = self.client.request(req).await;
		event!(
			target: "upstream request",
			parent: None,
			tracing::Level::DEBUG,

			client = self.name,
			http.method = %method,
			http.host = uri.authority().map(|a| a.as_str()),
			http.path = %uri.path(),
			http.status = resp.as_ref().ok().map(|r| r.status().as_u16()),
			duration = ?start.elapsed(),
		);
		Ok(resp.map_err(ProxyError::UpstreamCallFailed)?.map(Body::new))
	}
}

#[derive(Clone)]
struct Connector {
	trust: TrustPolicy,
	pinned: Option<EndpointAddr>,
}

impl tower::Service<Uri> for Connector {
	type Response = TokioIo<MaybeTlsStream>;
	type Error = io::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: Uri) -> Self::Future {
		let trust = self.trust.clone();
		let pinned = self.pinned.clone();
		Box::pin(async move {
			let https = match &pinned {
				Some(ep) => ep.tls,
				None => dst.scheme() == Some(&Scheme::HTTPS),
			};
			let logical_host = dst
				.host()
				.ok_or_else(|| io::Error::other("request URI has no host"))?
				.to_string();
			let default_port = if https { 443 } else { 80 };
			let (dial_host, dial_port) = match &pinned {
				Some(ep) => (ep.host.clone(), ep.port),
				None => (
					logical_host.clone(),
					dst.port_u16().unwrap_or(default_port),
				),
			};
			debug!(host = %dial_host, port = dial_port, tls = https, "dialing upstream");
			let tcp = TcpStream::connect((dial_host.as_str(), dial_port)).await?;
			tcp.set_nodelay(true)?;
			if !https {
				return Ok(TokioIo::new(MaybeTlsStream::Plain(tcp)));
			}
			let server_name =
				ServerName::try_from(logical_host).map_err(|e| io::Error::other(e.to_string()))?;
			let tls = TlsConnector::from(trust.config.clone())
				.connect(server_name, tcp)
				.await?;
			Ok(TokioIo::new(MaybeTlsStream::Tls(Box::new(tls))))
		})
	}
}

pub enum MaybeTlsStream {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection for MaybeTlsStream {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

impl AsyncRead for MaybeTlsStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for MaybeTlsStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
