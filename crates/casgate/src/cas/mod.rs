pub mod slo;

use anyhow::Context;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use tracing::debug;
use url::Url;

use crate::client::Client;
use crate::config::ProxyIdentity;
use crate::http::{Body, Method, Uri};
use crate::proxy::ProxyError;
use crate::session::Attributes;

/// The CAS protocol namespace all validation response elements live under.
pub const CAS_NS: &str = "http://www.yale.edu/tp/cas";

/// Reserved CAS query parameter names.
pub const TICKET_PARAM: &str = "ticket";
pub const SERVICE_PARAM: &str = "service";
pub const RENEW_PARAM: &str = "renew";
pub const PGT_URL_PARAM: &str = "pgtUrl";

/// Where the CAS server lives. Immutable after startup.
#[derive(Debug, Clone)]
pub struct CasInfo {
	pub login_url: Url,
	pub service_validate_url: Url,
	pub logout_url: Option<Url>,
}

/// Default `/serviceValidate` URL: the login URL with its last path segment
/// replaced.
pub fn derive_service_validate(login_url: &Url) -> anyhow::Result<Url> {
	let raw = login_url.as_str();
	let derived = match raw.rsplit_once('/') {
		Some((head, _)) => format!("{head}/serviceValidate"),
		None => raw.to_string(),
	};
	Url::parse(&derived).with_context(|| format!("cannot derive serviceValidate from '{raw}'"))
}

/// The `service` URL CAS redirects back to: the proxy's external base plus
/// the request URI exactly as received.
pub fn service_url(identity: &ProxyIdentity, uri: &Uri) -> String {
	let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	format!("{}{}", identity.external_base(), path_and_query)
}

/// Remove every `ticket` pair from the query, byte-for-byte preserving the
/// rest. The result must match the service URL sent in the login redirect.
pub fn strip_ticket_param(service_url: &str) -> String {
	let Some((base, query)) = service_url.split_once('?') else {
		return service_url.to_string();
	};
	let kept: Vec<&str> = query
		.split('&')
		.filter(|pair| {
			let name = pair.split('=').next().unwrap_or(pair);
			name != TICKET_PARAM
		})
		.collect();
	if kept.is_empty() {
		base.to_string()
	} else {
		format!("{base}?{}", kept.join("&"))
	}
}

/// Compose the CAS login redirect target: the configured login URL with
/// `service` merged into its query string, overwriting any existing value.
pub fn login_redirect_url(cas: &CasInfo, service_url: &str) -> String {
	let mut url = cas.login_url.clone();
	let existing: Vec<(String, String)> = url
		.query_pairs()
		.filter(|(name, _)| name != SERVICE_PARAM)
		.map(|(n, v)| (n.into_owned(), v.into_owned()))
		.collect();
	{
		let mut pairs = url.query_pairs_mut();
		pairs.clear();
		pairs.extend_pairs(existing);
		pairs.append_pair(SERVICE_PARAM, service_url);
	}
	url.to_string()
}

fn validate_url(cas: &CasInfo, service_url: &str, ticket: &str) -> String {
	let mut url = cas.service_validate_url.clone();
	{
		let mut pairs = url.query_pairs_mut();
		pairs.clear();
		pairs.append_pair(SERVICE_PARAM, service_url);
		pairs.append_pair(TICKET_PARAM, ticket);
	}
	url.to_string()
}

/// A successful `/serviceValidate` assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
	pub username: String,
	pub attributes: Attributes,
}

#[derive(thiserror::Error, Debug)]
pub enum CasResponseError {
	/// The response is not a CAS service response at all.
	#[error("malformed validation response: {0}")]
	Malformed(String),
	/// CAS answered, and the answer was no.
	#[error("{0}")]
	Denied(String),
}

/// Redeem `ticket` against `/serviceValidate` and parse the assertion.
pub async fn validate_ticket(
	client: &Client,
	cas: &CasInfo,
	service_url: &str,
	ticket: &str,
) -> Result<Validation, ProxyError> {
	let url = validate_url(cas, service_url, ticket);
	debug!(%url, "requesting service validation");
	let req = ::http::Request::builder()
		.method(Method::GET)
		.uri(&url)
		.body(Body::empty())
		.map_err(|e| ProxyError::Processing(e.into()))?;
	let resp = client.request(req).await?;
	let body = crate::http::read_body(resp.into_body(), 1024 * 1024)
		.await
		.map_err(ProxyError::Processing)?;
	let body = std::str::from_utf8(&body)
		.map_err(|_| CasResponseError::Malformed("response is not UTF-8".to_string()))?;
	Ok(parse_service_response(body)?)
}

/// Parse a `/serviceValidate` response body.
///
/// The root must be `{CAS_NS}serviceResponse` with exactly one
/// `authenticationSuccess` child holding exactly one `user`; every grandchild
/// of any `attributes` child is collected as `(local-name, text)`.
pub fn parse_service_response(body: &str) -> Result<Validation, CasResponseError> {
	let mut reader = NsReader::from_str(body);
	// Local names of currently open elements, outermost first.
	let mut path: Vec<String> = Vec::new();
	let mut root_ok = false;
	let mut success_count = 0usize;
	let mut user_count = 0usize;
	let mut username = String::new();
	let mut attributes = Attributes::new();
	let mut text = String::new();

	loop {
		let (ns, event) = reader
			.read_resolved_event()
			.map_err(|e| CasResponseError::Malformed(e.to_string()))?;
		let in_cas = matches!(&ns, ResolveResult::Bound(b) if b.as_ref() == CAS_NS.as_bytes());
		match event {
			Event::Start(e) => {
				let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
				classify_open(&path, in_cas, &local, &mut root_ok, &mut success_count, &mut user_count)?;
				text.clear();
				path.push(local);
			},
			Event::Empty(e) => {
				let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
				classify_open(&path, in_cas, &local, &mut root_ok, &mut success_count, &mut user_count)?;
				record_close(&path, &local, "", &mut username, &mut attributes);
			},
			Event::Text(t) => {
				let chunk = t
					.unescape()
					.map_err(|e| CasResponseError::Malformed(e.to_string()))?;
				text.push_str(&chunk);
			},
			Event::CData(t) => {
				text.push_str(&String::from_utf8_lossy(&t));
			},
			Event::End(e) => {
				let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
				path.pop();
				record_close(&path, &local, &text, &mut username, &mut attributes);
				text.clear();
			},
			Event::Eof => break,
			_ => {},
		}
	}

	if !root_ok {
		return Err(CasResponseError::Malformed(
			"root element is not serviceResponse".to_string(),
		));
	}
	if success_count != 1 {
		return Err(CasResponseError::Denied(
			"no authenticationSuccess in validation response".to_string(),
		));
	}
	if user_count != 1 {
		return Err(CasResponseError::Denied(format!(
			"expected exactly one user element, found {user_count}"
		)));
	}
	Ok(Validation {
		username,
		attributes,
	})
}

/// Validate an element as it opens. `path` holds its ancestors.
fn classify_open(
	path: &[String],
	in_cas: bool,
	local: &str,
	root_ok: &mut bool,
	success_count: &mut usize,
	user_count: &mut usize,
) -> Result<(), CasResponseError> {
	if path.is_empty() {
		if !(in_cas && local == "serviceResponse") {
			return Err(CasResponseError::Malformed(
				"root element is not serviceResponse".to_string(),
			));
		}
		*root_ok = true;
	} else if path.len() == 1 && in_cas && local == "authenticationSuccess" {
		*success_count += 1;
	} else if path.len() == 2
		&& in_cas && local == "user"
		&& path[1] == "authenticationSuccess"
	{
		*user_count += 1;
	}
	Ok(())
}

/// Record an element's text as it closes. `parent_path` holds its ancestors.
fn record_close(
	parent_path: &[String],
	local: &str,
	text: &str,
	username: &mut String,
	attributes: &mut Attributes,
) {
	let trimmed = text.trim();
	match parent_path {
		[_, success] if success == "authenticationSuccess" && local == "user" => {
			username.clear();
			username.push_str(trimmed);
		},
		[_, success, attrs] if success == "authenticationSuccess" && attrs == "attributes" => {
			attributes
				.entry(local.to_string())
				.or_default()
				.push(trimmed.to_string());
		},
		_ => {},
	}
}
