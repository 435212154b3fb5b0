use std::collections::HashSet;
use std::sync::Arc;

use headers::HeaderMapExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, warn};

use crate::ProxyInputs;
use crate::cas::{self, slo};
use crate::http::rewrite;
use crate::http::{
	Body, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, header,
};
use crate::proxy::ProxyError;
use crate::session::SessionStore;

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;

/// Cookie carrying the opaque browser session id.
pub const SESSION_COOKIE: &str = "casgate-session";

const SLO_BODY_LIMIT: usize = 256 * 1024;
const MODIFIED_BODY_LIMIT: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct CasProxy {
	pub inputs: Arc<ProxyInputs>,
}

impl CasProxy {
	/// Entry point for every inbound request. `secure` reflects whether the
	/// connection it arrived on was TLS.
	pub async fn proxy(&self, req: ::http::Request<Incoming>, secure: bool) -> Response {
		let req = req.map(Body::new);
		let (session_id, fresh) = match session_id_from(req.headers()) {
			Some(id) => (id, false),
			None => (SessionStore::new_session_id(), true),
		};
		let result = self.dispatch(req, &session_id, secure).await;
		let mut resp = result.unwrap_or_else(|err| {
			warn!(error = %err, "request failed");
			err.into_response()
		});
		if fresh {
			resp
				.headers_mut()
				.append(header::SET_COOKIE, session_cookie(&session_id, secure));
		}
		resp
	}

	/// The per-request state machine; first match wins.
	async fn dispatch(
		&self,
		req: Request,
		session_id: &str,
		secure: bool,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		if let Some(pattern) = cfg.logout_patterns.iter().find(|p| p.matches(req.uri())) {
			info!(
				pattern = pattern.as_str(),
				session = session_id,
				"logout pattern matched"
			);
			self.inputs.sessions.destroy(session_id);
			return self.finish_logout(req, session_id, secure).await;
		}
		if self.is_excluded(req.uri().path()) {
			debug!(path = req.uri().path(), "excluded resource");
			return self.reverse_proxy(req, false, session_id, secure).await;
		}
		if !self.inputs.sessions.is_authenticated(session_id) {
			debug!(
				session = session_id,
				"session not authenticated, negotiating with CAS"
			);
			return self.authenticate(req, session_id).await;
		}
		if cfg.auth_info_resource.as_deref() == Some(req.uri().path()) {
			debug!("providing authentication info");
			return self.deliver_auth_info(session_id);
		}
		self.reverse_proxy(req, true, session_id, secure).await
	}

	fn is_excluded(&self, path: &str) -> bool {
		let cfg = &self.inputs.cfg;
		cfg.excluded_resources.iter().any(|r| r == path)
			|| cfg
				.excluded_branches
				.iter()
				.any(|b| rewrite::is_origin_path_or_child(b, path))
	}

	/// The session is already gone; decide what the logout request itself
	/// turns into.
	async fn finish_logout(
		&self,
		req: Request,
		session_id: &str,
		secure: bool,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		let Some(logout_url) = &cfg.cas.logout_url else {
			return self.reverse_proxy(req, false, session_id, secure).await;
		};
		if cfg.logout_passthrough {
			// Let the origin see the logout too, but don't make the
			// user-agent wait on it.
			let this = self.clone();
			let session_id = session_id.to_string();
			tokio::spawn(async move {
				if let Err(e) = this.reverse_proxy(req, false, &session_id, secure).await {
					debug!(error = %e, "logout passthrough to origin failed");
				}
			});
		}
		Ok(crate::http::redirect_response(logout_url.as_str()))
	}

	/// No valid session: try SLO intake, then ticket validation, then send
	/// the user-agent to CAS login.
	async fn authenticate(
		&self,
		mut req: Request,
		session_id: &str,
	) -> Result<Response, ProxyError> {
		if req.method() == Method::POST && has_xml_content_type(req.headers()) {
			let (parts, body) = req.into_parts();
			let bytes = crate::http::read_body(body, SLO_BODY_LIMIT)
				.await
				.unwrap_or_default();
			if let Some(resp) = self.try_single_logout(&bytes) {
				return Ok(resp);
			}
			req = Request::from_parts(parts, Body::from(bytes));
		}
		if let Some(ticket) = single_ticket_param(req.uri()) {
			return self.validate_ticket(&ticket, req.uri(), session_id).await;
		}
		self.redirect_to_cas_login(req).await
	}

	/// Returns the empty-200 response iff the body is a usable SAML
	/// LogoutRequest that revoked a live session.
	fn try_single_logout(&self, body: &[u8]) -> Option<Response> {
		let body = std::str::from_utf8(body).ok()?;
		let skew = self.inputs.cfg.logout_instant_skew;
		match slo::parse_logout_request(body, skew, chrono::Utc::now()) {
			Ok(ticket) => match self.inputs.sessions.destroy_by_ticket(&ticket) {
				Some(session) => {
					info!(ticket, session, "single logout revoked session");
					Some(crate::http::empty_response(StatusCode::OK))
				},
				None => {
					info!(ticket, "no matching session for logout request");
					None
				},
			},
			Err(e) => {
				info!(error = %e, "POST body was not a usable logout request");
				None
			},
		}
	}

	async fn validate_ticket(
		&self,
		ticket: &str,
		req_uri: &Uri,
		session_id: &str,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		// Byte-identical to the service URL from the login redirect, minus
		// the ticket CAS appended.
		let service_url = cas::strip_ticket_param(&cas::service_url(&cfg.identity, req_uri));
		let validation =
			cas::validate_ticket(&self.inputs.cas, &cfg.cas, &service_url, ticket).await;
		let validation = match validation {
			Ok(v) => v,
			Err(e) => {
				info!(ticket, service = service_url, error = %e, "ticket validation failed");
				return Err(e);
			},
		};
		for ac in &self.inputs.plugins.access_controls {
			if let Err(reason) = ac.is_allowed(&validation.username, &validation.attributes) {
				info!(
					username = validation.username,
					plugin = ac.tag(),
					reason,
					service = service_url,
					ticket,
					"access denied"
				);
				return Err(ProxyError::AccessDenied(reason));
			}
		}
		self
			.inputs
			.sessions
			.bind(session_id, &validation.username, ticket, validation.attributes);
		info!(
			username = validation.username,
			session = session_id,
			"ticket validated, redirecting to service"
		);
		Ok(crate::http::redirect_response(&service_url))
	}

	async fn redirect_to_cas_login(&self, req: Request) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		let mut service_url = cas::service_url(&cfg.identity, req.uri());
		let (parts, _body) = req.into_parts();
		for plugin in &self.inputs.plugins.cas_redirects {
			service_url = plugin.intercept_service_url(service_url, &parts).await;
		}
		let login = cas::login_redirect_url(&cfg.cas, &service_url);
		info!(url = login, "redirecting to CAS login");
		Ok(crate::http::redirect_response(&login))
	}

	fn deliver_auth_info(&self, session_id: &str) -> Result<Response, ProxyError> {
		let (username, attributes) = self
			.inputs
			.sessions
			.auth_info(session_id)
			.ok_or(ProxyError::InvalidRequest)?;
		Ok(crate::http::json_response(&serde_json::json!({
			"username": username,
			"attributes": attributes,
		})))
	}

	/// Forward a request to the origin: header rewrite, interceptor chain,
	/// upgrade hand-off, then the streaming round trip.
	pub(crate) async fn reverse_proxy(
		&self,
		req: Request,
		protected: bool,
		session_id: &str,
		secure: bool,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		let username = if protected {
			match self.inputs.sessions.username(session_id) {
				Some(u) => Some(u),
				// Lost a race with logout; only a fresh ticket gets them back.
				None => return self.redirect_to_cas_login(req).await,
			}
		} else {
			None
		};

		let mut headers = rewrite::request_headers(req.headers(), &cfg.identity, &cfg.origin);
		if let Some(username) = &username {
			headers.insert(
				cfg.remote_user_header.clone(),
				HeaderValue::try_from(username.as_str()).map_err(|_| ProxyError::InvalidRequest)?,
			);
		}

		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str())
			.unwrap_or("/");
		let url = format!("{}{}", cfg.origin.base(), path_and_query);

		let claimed = self
			.inputs
			.plugins
			.interceptors
			.iter()
			.find(|i| i.claims(&url, req.method(), &headers));
		if let Some(interceptor) = claimed {
			debug!(url, "resource claimed by interceptor");
			let (mut parts, body) = req.into_parts();
			parts.headers = headers;
			return interceptor
				.handle(&url, Request::from_parts(parts, body))
				.await
				.map_err(ProxyError::InterceptorFailed);
		}

		let websocket = is_websocket_upgrade(req.headers());
		let (mut parts, inbound_body) = req.into_parts();
		let client_upgrade = parts.extensions.remove::<OnUpgrade>();
		let upgrade_type = hop_by_hop_headers(&mut headers);

		if websocket {
			let endpoint = cfg.origin.websocket_endpoint();
			let ws_url = format!("{}{}", cfg.identity.websocket_base(), parts.uri.path());
			info!(endpoint = %endpoint, url = ws_url, "bridging websocket upgrade");
			// The origin-side handshake announces the proxy-space URL.
			if let Ok(hv) = HeaderValue::try_from(ws_url) {
				headers.insert(header::ORIGIN, hv);
			}
		}

		let body = if parts.method == Method::PUT || parts.method == Method::POST {
			inbound_body
		} else {
			Body::empty()
		};
		let out_uri: Uri = url
			.parse()
			.map_err(|e: ::http::uri::InvalidUri| ProxyError::Processing(e.into()))?;
		let mut out = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(out_uri)
			.body(body)
			.map_err(|e| ProxyError::Processing(e.into()))?;
		*out.headers_mut() = headers;

		debug!(url, protected, "proxying request");
		let resp = self.inputs.origin.request(out).await?;

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			return handle_upgrade(upgrade_type, client_upgrade, resp).await;
		}
		self.rewrite_response(&parts, resp, secure).await
	}

	/// Response half of the pipeline: Location and Set-Cookie come back into
	/// proxy-space, then the body runs the content-modifier chain.
	async fn rewrite_response(
		&self,
		req_parts: &::http::request::Parts,
		mut resp: Response,
		secure: bool,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		if matches!(resp.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
			let locations: Vec<HeaderValue> =
				resp.headers().get_all(header::LOCATION).iter().cloned().collect();
			if let [location] = locations.as_slice()
				&& let Ok(location) = location.to_str()
			{
				let scheme = if secure { "https" } else { "http" };
				if let Some(rewritten) =
					rewrite::origin_to_proxy(&cfg.identity, &cfg.origin, scheme, location)
					&& let Ok(hv) = HeaderValue::try_from(rewritten.as_str())
				{
					debug!(from = location, to = rewritten, "rewrote Location header");
					resp.headers_mut().insert(header::LOCATION, hv);
				}
			}
		}

		let cookies: Vec<HeaderValue> = resp
			.headers()
			.get_all(header::SET_COOKIE)
			.iter()
			.cloned()
			.collect();
		if !cookies.is_empty() {
			let headers = resp.headers_mut();
			headers.remove(header::SET_COOKIE);
			for value in cookies {
				headers.append(
					header::SET_COOKIE,
					rewrite::rewrite_set_cookie(&cfg.origin.path, &value),
				);
			}
		}

		for name in [
			header::CONNECTION,
			header::TRANSFER_ENCODING,
			HeaderName::from_static("keep-alive"),
		] {
			resp.headers_mut().remove(name);
		}

		if self.inputs.plugins.content_modifiers.is_empty() {
			return Ok(resp);
		}
		let (mut parts, body) = resp.into_parts();
		let mut bytes = crate::http::read_body(body, MODIFIED_BODY_LIMIT)
			.await
			.map_err(ProxyError::Processing)?;
		for modifier in &self.inputs.plugins.content_modifiers {
			bytes = modifier
				.transform(bytes, req_parts)
				.await
				.map_err(ProxyError::Processing)?;
		}
		parts.headers.remove(header::CONTENT_LENGTH);
		Ok(Response::from_parts(parts, Body::from(bytes)))
	}
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
	for value in headers.get_all(header::COOKIE) {
		let Ok(raw) = value.to_str() else { continue };
		for c in cookie::Cookie::split_parse(raw).flatten() {
			if c.name() == SESSION_COOKIE {
				return Some(c.value().to_string());
			}
		}
	}
	None
}

fn session_cookie(session_id: &str, secure: bool) -> HeaderValue {
	let mut cookie = cookie::Cookie::build((SESSION_COOKIE, session_id))
		.path("/")
		.http_only(true);
	if secure {
		cookie = cookie.secure(true);
	}
	HeaderValue::try_from(cookie.build().to_string())
		.expect("session cookie is a valid header value")
}

fn has_xml_content_type(headers: &HeaderMap) -> bool {
	headers.get_all(header::CONTENT_TYPE).iter().any(|v| {
		v.to_str()
			.map(|ct| ct.contains("text/xml") || ct.contains("application/xml"))
			.unwrap_or(false)
	})
}

/// The `ticket` query parameter, iff it appears with exactly one value.
fn single_ticket_param(uri: &Uri) -> Option<String> {
	let query = uri.query()?;
	let values: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
		.filter(|(name, _)| name == cas::TICKET_PARAM)
		.map(|(_, value)| value.into_owned())
		.collect();
	match values.as_slice() {
		[one] => Some(one.clone()),
		_ => None,
	}
}

/// Comma-split, set-membership upgrade detection.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	let tokens = |name: HeaderName| -> HashSet<String> {
		headers
			.get_all(name)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(|v| v.split(','))
			.map(|t| t.trim().to_ascii_lowercase())
			.collect()
	};
	tokens(header::UPGRADE).contains("websocket") && tokens(header::CONNECTION).contains("upgrade")
}

// Hop-by-hop headers, removed before the request is re-issued upstream
// (RFC 7230 §6.1).
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	if let Some(con) = headers.typed_get::<headers::Connection>() {
		if con.contains(header::UPGRADE) {
			headers.get(header::UPGRADE).cloned()
		} else {
			None
		}
	} else {
		None
	}
}

/// Strip hop-by-hop headers, then restore the pieces a protocol upgrade
/// needs on the outbound leg.
fn hop_by_hop_headers(headers: &mut HeaderMap) -> Option<HeaderValue> {
	let trailers = headers
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade = upgrade_type(headers);
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
	if trailers {
		headers.typed_insert(headers::Te::trailers());
	}
	if let Some(upgrade) = &upgrade {
		headers.typed_insert(headers::Connection::upgrade());
		headers.insert(header::UPGRADE, upgrade.clone());
	}
	upgrade
}

/// Both peers agreed to switch protocols: splice the two upgraded streams
/// together and let bytes flow until either side closes.
async fn handle_upgrade(
	req_upgrade_type: Option<HeaderValue>,
	client_upgrade: Option<OnUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(requested) = req_upgrade_type else {
		return Err(ProxyError::UpgradeFailed(None, None));
	};
	let resp_upgrade_type = upgrade_type(resp.headers());
	if Some(&requested) != resp_upgrade_type.as_ref() {
		return Err(ProxyError::UpgradeFailed(Some(requested), resp_upgrade_type));
	}
	let client_upgrade =
		client_upgrade.ok_or(ProxyError::UpgradeFailed(Some(requested.clone()), None))?;
	let origin_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("origin offered no upgrade")))?
		.await
		.map_err(|e| ProxyError::Processing(anyhow::anyhow!("origin upgrade failed: {e}")))?;
	tokio::spawn(async move {
		let client_upgraded = match client_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				error!("client upgrade error: {e}");
				return;
			},
		};
		match tokio::io::copy_bidirectional(
			&mut TokioIo::new(client_upgraded),
			&mut TokioIo::new(origin_upgraded),
		)
		.await
		{
			Ok((up, down)) => debug!(up, down, "tunnel closed"),
			Err(e) => debug!("tunnel error: {e}"),
		}
	});
	Ok(resp)
}
