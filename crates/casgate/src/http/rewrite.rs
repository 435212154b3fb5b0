use anyhow::{Context, bail};
use url::Url;

use crate::config::{Origin, ProxyIdentity};
use crate::http::{HeaderMap, HeaderValue, Uri, header};

/// A relative-only URL pattern; shell-glob semantics on the path component.
#[derive(Debug, Clone)]
pub struct UrlPattern {
	raw: String,
	pattern: glob::Pattern,
}

impl UrlPattern {
	pub fn parse(raw: &str) -> anyhow::Result<UrlPattern> {
		if Url::parse(raw).is_ok() {
			bail!("logout pattern '{raw}' must be a relative URL");
		}
		let path = raw.split(['?', '#']).next().unwrap_or(raw);
		let pattern =
			glob::Pattern::new(path).with_context(|| format!("invalid logout pattern '{raw}'"))?;
		Ok(UrlPattern {
			raw: raw.to_string(),
			pattern,
		})
	}

	pub fn matches(&self, uri: &Uri) -> bool {
		self.pattern.matches(uri.path())
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}
}

/// `path` equals the mount `base`, or lives under it.
pub fn is_origin_path_or_child(base: &str, path: &str) -> bool {
	path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
}

/// Rewrite a proxy-space absolute URL into origin-space. Applied to inbound
/// `Referer` values. `None` means the URL does not address this proxy and
/// must be left alone.
pub fn proxy_to_origin(identity: &ProxyIdentity, origin: &Origin, target: &str) -> Option<String> {
	let url = Url::parse(target).ok()?;
	if url.scheme() != identity.scheme() {
		return None;
	}
	if url.host_str() != Some(identity.fqdn.as_str()) {
		return None;
	}
	if url.port_or_known_default() != Some(identity.port) {
		return None;
	}
	let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
	Some(format!(
		"{}://{}{}{}{}",
		origin.scheme,
		origin.netloc,
		origin.path,
		url.path(),
		query
	))
}

/// Rewrite an origin-space absolute URL back into proxy-space. Applied to
/// response `Location` values; `proxy_scheme` reflects whether the inbound
/// connection was TLS. `None` means the URL points outside the mount.
pub fn origin_to_proxy(
	identity: &ProxyIdentity,
	origin: &Origin,
	proxy_scheme: &str,
	target: &str,
) -> Option<String> {
	let url = Url::parse(target).ok()?;
	if url.scheme() != origin.scheme {
		return None;
	}
	if url.host_str() != Some(origin.host.as_str()) {
		return None;
	}
	if url.port_or_known_default() != Some(origin.effective_port()) {
		return None;
	}
	if !is_origin_path_or_child(&origin.path, url.path()) {
		return None;
	}
	let mut path = &url.path()[origin.path.len()..];
	if path.is_empty() {
		path = "/";
	}
	let default_port = if proxy_scheme == "https" { 443 } else { 80 };
	let netloc = if identity.port == default_port {
		identity.fqdn.clone()
	} else {
		format!("{}:{}", identity.fqdn, identity.port)
	};
	let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
	Some(format!("{proxy_scheme}://{netloc}{path}{query}"))
}

/// Clone request headers into their origin-bound form: `Host` and `Origin`
/// become the origin netloc, `Content-Length` is dropped (the outbound client
/// recomputes it), and a lone `Referer` is rewritten into origin-space while
/// any ambiguity drops it entirely.
pub fn request_headers(
	headers: &HeaderMap,
	identity: &ProxyIdentity,
	origin: &Origin,
) -> HeaderMap {
	let mut out = headers.clone();
	let netloc = HeaderValue::try_from(origin.netloc.as_str())
		.expect("origin netloc is a valid header value");
	out.insert(header::HOST, netloc.clone());
	if out.contains_key(header::ORIGIN) {
		out.insert(header::ORIGIN, netloc);
	}
	out.remove(header::CONTENT_LENGTH);

	let referers: Vec<HeaderValue> = out.get_all(header::REFERER).iter().cloned().collect();
	if !referers.is_empty() {
		let rewritten = if referers.len() == 1 {
			referers[0]
				.to_str()
				.ok()
				.and_then(|r| proxy_to_origin(identity, origin, r))
				.and_then(|r| HeaderValue::try_from(r).ok())
		} else {
			None
		};
		match rewritten {
			Some(r) => {
				tracing::debug!(referer = ?r, "rewrote Referer header");
				out.insert(header::REFERER, r);
			},
			None => {
				out.remove(header::REFERER);
			},
		}
	}
	out
}

/// Rewrite one `Set-Cookie` value: cookies scoped to the origin mount (or a
/// child of it) get the mount prefix stripped from their `Path`. Unparseable
/// values pass through untouched.
pub fn rewrite_set_cookie(origin_path: &str, value: &HeaderValue) -> HeaderValue {
	let Ok(raw) = value.to_str() else {
		return value.clone();
	};
	let Ok(mut c) = cookie::Cookie::parse(raw.to_string()) else {
		return value.clone();
	};
	let Some(path) = c.path() else {
		return value.clone();
	};
	if !is_origin_path_or_child(origin_path, path) {
		return value.clone();
	}
	let mut stripped = path[origin_path.len()..].to_string();
	if stripped.is_empty() {
		stripped = "/".to_string();
	}
	c.set_path(stripped);
	HeaderValue::try_from(c.to_string()).unwrap_or_else(|_| value.clone())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn identity() -> ProxyIdentity {
		ProxyIdentity {
			fqdn: "p.example".into(),
			port: 443,
			is_https: true,
		}
	}

	fn origin() -> Origin {
		Origin::parse("https://o.internal/app").unwrap()
	}

	#[test]
	fn patterns_must_be_relative() {
		assert!(UrlPattern::parse("https://evil/logout").is_err());
		assert!(UrlPattern::parse("/logout*").is_ok());
	}

	#[test]
	fn pattern_globs_the_path() {
		let p = UrlPattern::parse("/account/logout*").unwrap();
		assert!(p.matches(&"/account/logout".parse().unwrap()));
		assert!(p.matches(&"/account/logout?next=1".parse().unwrap()));
		assert!(p.matches(&"/account/logout/now".parse().unwrap()));
		assert!(!p.matches(&"/account/login".parse().unwrap()));
	}

	#[test]
	fn path_containment() {
		assert!(is_origin_path_or_child("/app", "/app"));
		assert!(is_origin_path_or_child("/app", "/app/sub"));
		assert!(!is_origin_path_or_child("/app", "/application"));
		assert!(is_origin_path_or_child("", "/anything"));
	}

	#[test]
	fn rewrites_round_trip_inside_the_mount() {
		let id = identity();
		let o = origin();
		for url in [
			"https://p.example/page",
			"https://p.example/",
			"https://p.example/a/b?x=1&y=2",
		] {
			let to_origin = proxy_to_origin(&id, &o, url).unwrap();
			assert_eq!(
				origin_to_proxy(&id, &o, "https", &to_origin).as_deref(),
				Some(url)
			);
		}
	}

	#[test]
	fn rewrites_decline_outside_the_mount() {
		let id = identity();
		let o = origin();
		assert_eq!(proxy_to_origin(&id, &o, "https://elsewhere.example/p"), None);
		assert_eq!(proxy_to_origin(&id, &o, "http://p.example/p"), None);
		assert_eq!(
			origin_to_proxy(&id, &o, "https", "https://o.internal/other/p"),
			None
		);
		assert_eq!(
			origin_to_proxy(&id, &o, "https", "https://unrelated.example/app/p"),
			None
		);
	}

	#[test]
	fn location_rewrite_strips_the_mount() {
		let id = identity();
		let o = origin();
		assert_eq!(
			origin_to_proxy(&id, &o, "https", "https://o.internal/app/next").as_deref(),
			Some("https://p.example/next")
		);
		assert_eq!(
			origin_to_proxy(&id, &o, "https", "https://o.internal/app").as_deref(),
			Some("https://p.example/")
		);
	}

	#[test]
	fn nondefault_external_port_is_kept() {
		let id = ProxyIdentity {
			fqdn: "p.example".into(),
			port: 8443,
			is_https: true,
		};
		let o = origin();
		assert_eq!(
			origin_to_proxy(&id, &o, "https", "https://o.internal/app/x").as_deref(),
			Some("https://p.example:8443/x")
		);
		assert_eq!(
			proxy_to_origin(&id, &o, "https://p.example:8443/x").as_deref(),
			Some("https://o.internal/app/x")
		);
	}

	#[test]
	fn request_headers_are_rewritten() {
		let mut h = HeaderMap::new();
		h.insert(header::HOST, HeaderValue::from_static("p.example"));
		h.insert(header::ORIGIN, HeaderValue::from_static("https://p.example"));
		h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
		h.insert(
			header::REFERER,
			HeaderValue::from_static("https://p.example/from"),
		);
		h.insert("x-custom", HeaderValue::from_static("kept"));
		let out = request_headers(&h, &identity(), &origin());
		assert_eq!(out.get(header::HOST).unwrap(), "o.internal");
		assert_eq!(out.get(header::ORIGIN).unwrap(), "o.internal");
		assert!(out.get(header::CONTENT_LENGTH).is_none());
		assert_eq!(
			out.get(header::REFERER).unwrap(),
			"https://o.internal/app/from"
		);
		assert_eq!(out.get("x-custom").unwrap(), "kept");
	}

	#[test]
	fn foreign_referer_is_dropped() {
		let mut h = HeaderMap::new();
		h.insert(
			header::REFERER,
			HeaderValue::from_static("https://elsewhere.example/x"),
		);
		let out = request_headers(&h, &identity(), &origin());
		assert!(out.get(header::REFERER).is_none());
	}

	#[test]
	fn ambiguous_referer_is_dropped() {
		let mut h = HeaderMap::new();
		h.append(
			header::REFERER,
			HeaderValue::from_static("https://p.example/a"),
		);
		h.append(
			header::REFERER,
			HeaderValue::from_static("https://p.example/b"),
		);
		let out = request_headers(&h, &identity(), &origin());
		assert!(out.get(header::REFERER).is_none());
	}

	#[test]
	fn cookie_paths_under_the_mount_are_stripped() {
		let v = HeaderValue::from_static("s=1; Path=/app/sub");
		assert_eq!(rewrite_set_cookie("/app", &v), "s=1; Path=/sub");
		let v = HeaderValue::from_static("s=1; Path=/app");
		assert_eq!(rewrite_set_cookie("/app", &v), "s=1; Path=/");
		let v = HeaderValue::from_static("s=1; Path=/other");
		assert_eq!(rewrite_set_cookie("/app", &v), "s=1; Path=/other");
		let v = HeaderValue::from_static("s=1");
		assert_eq!(rewrite_set_cookie("/app", &v), "s=1");
	}
}
