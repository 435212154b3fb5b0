use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::client::Client;
use crate::config::{
	Config, DEFAULT_LOGOUT_INSTANT_SKEW, ListenEndpoint, Origin, ProxyIdentity,
};
use crate::http::trust::TrustPolicy;
use crate::plugins::{PluginHandle, PluginSet};
use crate::session::SessionStore;

const CAS_OK: &str = r#"<serviceResponse xmlns="http://www.yale.edu/tp/cas"><authenticationSuccess><user>alice</user><attributes><role>admin</role></attributes></authenticationSuccess></serviceResponse>"#;

fn test_config(port: u16, origin: &str, cas_base: &str) -> Config {
	Config {
		listen: ListenEndpoint::Tcp { port },
		origin: Origin::parse(origin).unwrap(),
		cas: crate::cas::CasInfo {
			login_url: url::Url::parse(&format!("{cas_base}/login")).unwrap(),
			service_validate_url: url::Url::parse(&format!("{cas_base}/serviceValidate")).unwrap(),
			logout_url: None,
		},
		identity: ProxyIdentity {
			fqdn: "127.0.0.1".to_string(),
			port,
			is_https: false,
		},
		excluded_resources: vec![],
		excluded_branches: vec![],
		logout_patterns: vec![],
		logout_passthrough: false,
		auth_info_resource: Some("/authinfo".to_string()),
		remote_user_header: HeaderName::from_static("remote-user"),
		logout_instant_skew: DEFAULT_LOGOUT_INSTANT_SKEW,
		session_ttl: Duration::from_secs(60),
		authorities: vec![],
		origin_endpoint: None,
		cas_endpoint: None,
	}
}

/// Bind a real listener and serve `CasProxy` on it, the way the gateway
/// does, minus TLS and lifecycle management.
async fn serve(
	make_cfg: impl FnOnce(u16) -> Config,
	handles: Vec<PluginHandle>,
) -> (String, Arc<ProxyInputs>) {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let cfg = Arc::new(make_cfg(port));
	let trust = TrustPolicy::load(&[]).unwrap();
	let inputs = Arc::new(ProxyInputs {
		cfg,
		sessions: SessionStore::new(Duration::from_secs(60)),
		plugins: Arc::new(PluginSet::build(handles).unwrap()),
		origin: Client::new("origin", trust.clone(), None),
		cas: Client::new("cas", trust, None),
	});
	let proxy = CasProxy {
		inputs: inputs.clone(),
	};
	tokio::spawn(async move {
		loop {
			let Ok((stream, _peer)) = listener.accept().await else {
				break;
			};
			let proxy = proxy.clone();
			tokio::spawn(async move {
				let service = hyper::service::service_fn(move |req| {
					let proxy = proxy.clone();
					async move { Ok::<_, Infallible>(proxy.proxy(req, false).await) }
				});
				let _ = auto::Builder::new(TokioExecutor::new())
					.serve_connection_with_upgrades(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	(format!("http://127.0.0.1:{port}"), inputs)
}

fn user_agent() -> reqwest::Client {
	reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.cookie_store(true)
		.build()
		.unwrap()
}

async fn establish_session(ua: &reqwest::Client, base: &str, cas: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/serviceValidate"))
		.and(query_param("ticket", "ST-1"))
		.respond_with(ResponseTemplate::new(200).set_body_string(CAS_OK))
		.mount(cas)
		.await;
	let resp = ua
		.get(format!("{base}/app/page?ticket=ST-1"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 302);
}

#[tokio::test]
async fn unauthenticated_get_redirects_to_cas_login() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;
	let port = base.rsplit(':').next().unwrap();

	let resp = user_agent()
		.get(format!("{base}/app/page"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 302);
	let expected = format!(
		"{}/login?service=http%3A%2F%2F127.0.0.1%3A{port}%2Fapp%2Fpage",
		cas.uri()
	);
	assert_eq!(
		resp.headers().get("location").unwrap().to_str().unwrap(),
		expected
	);
}

#[tokio::test]
async fn ticket_callback_establishes_a_session() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, inputs) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;
	let port = base.rsplit(':').next().unwrap();

	Mock::given(method("GET"))
		.and(path("/serviceValidate"))
		.and(query_param("ticket", "ST-1"))
		.and(query_param(
			"service",
			format!("http://127.0.0.1:{port}/app/page"),
		))
		.respond_with(ResponseTemplate::new(200).set_body_string(CAS_OK))
		.mount(&cas)
		.await;

	let ua = user_agent();
	let resp = ua
		.get(format!("{base}/app/page?ticket=ST-1"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 302);
	assert_eq!(
		resp.headers().get("location").unwrap().to_str().unwrap(),
		format!("http://127.0.0.1:{port}/app/page")
	);
	assert!(
		inputs.sessions.destroy_by_ticket("ST-1").is_some(),
		"validated ticket must be resolvable through the logout index"
	);
}

#[tokio::test]
async fn auth_info_reports_username_and_attributes() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	let ua = user_agent();
	establish_session(&ua, &base, &cas).await;

	let resp = ua.get(format!("{base}/authinfo")).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"application/json"
	);
	let doc: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(doc["username"], "alice");
	assert_eq!(doc["attributes"]["role"][0], "admin");
}

#[tokio::test]
async fn proxied_requests_carry_the_remote_user_header() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	Mock::given(method("GET"))
		.and(path("/page"))
		.and(header("remote-user", "alice"))
		.respond_with(ResponseTemplate::new(200).set_body_string("hello from origin"))
		.mount(&origin)
		.await;

	let ua = user_agent();
	establish_session(&ua, &base, &cas).await;

	let resp = ua.get(format!("{base}/page")).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "hello from origin");
}

#[tokio::test]
async fn single_logout_revokes_the_session() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, inputs) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	let ua = user_agent();
	establish_session(&ua, &base, &cas).await;

	// SLO arrives on its own connection, without the session cookie.
	let slo_body = format!(
		"<samlp:LogoutRequest xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\" IssueInstant=\"{}\"><samlp:SessionIndex>ST-1</samlp:SessionIndex></samlp:LogoutRequest>",
		chrono::Utc::now().to_rfc3339()
	);
	let resp = reqwest::Client::new()
		.post(format!("{base}/anything"))
		.header("content-type", "text/xml")
		.body(slo_body)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert!(resp.text().await.unwrap().is_empty());
	assert_eq!(inputs.sessions.destroy_by_ticket("ST-1"), None);

	// The browser session is gone; the next request renegotiates with CAS.
	let resp = ua.get(format!("{base}/page")).send().await.unwrap();
	assert_eq!(resp.status(), 302);
	assert!(
		resp
			.headers()
			.get("location")
			.unwrap()
			.to_str()
			.unwrap()
			.starts_with(&format!("{}/login?", cas.uri()))
	);
}

#[tokio::test]
async fn non_slo_xml_posts_fall_through_to_cas_login() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	let resp = reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.build()
		.unwrap()
		.post(format!("{base}/anything"))
		.header("content-type", "application/xml")
		.body("<notAnSlo/>")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 302);
	assert!(
		resp
			.headers()
			.get("location")
			.unwrap()
			.to_str()
			.unwrap()
			.starts_with(&format!("{}/login?", cas.uri()))
	);
}

#[tokio::test]
async fn ambiguous_ticket_params_redirect_to_login() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	let resp = user_agent()
		.get(format!("{base}/x?ticket=ST-1&ticket=ST-2"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 302);
	let location = resp.headers().get("location").unwrap().to_str().unwrap();
	assert!(location.starts_with(&format!("{}/login?", cas.uri())));
}

#[tokio::test]
async fn malformed_validation_responses_are_a_server_error() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	Mock::given(method("GET"))
		.and(path("/serviceValidate"))
		.respond_with(ResponseTemplate::new(200).set_body_string("surprise, not xml"))
		.mount(&cas)
		.await;

	let resp = user_agent()
		.get(format!("{base}/x?ticket=ST-9"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn denied_validation_responses_are_forbidden() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![]).await;

	Mock::given(method("GET"))
		.and(path("/serviceValidate"))
		.respond_with(ResponseTemplate::new(200).set_body_string(
			r#"<serviceResponse xmlns="http://www.yale.edu/tp/cas"><authenticationFailure code="INVALID_TICKET"/></serviceResponse>"#,
		))
		.mount(&cas)
		.await;

	let resp = user_agent()
		.get(format!("{base}/x?ticket=ST-10"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn access_control_plugins_can_deny_validated_users() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let plugin = (crate::plugins::registry()[0].build)("role=superuser").unwrap();
	let (base, inputs) = serve(|p| test_config(p, &origin.uri(), &cas_base), vec![plugin]).await;

	Mock::given(method("GET"))
		.and(path("/serviceValidate"))
		.respond_with(ResponseTemplate::new(200).set_body_string(CAS_OK))
		.mount(&cas)
		.await;

	let resp = user_agent()
		.get(format!("{base}/x?ticket=ST-1"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 403);
	assert_eq!(inputs.sessions.destroy_by_ticket("ST-1"), None);
}

#[tokio::test]
async fn excluded_resources_pass_through_unauthenticated() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let (base, _) = serve(
		|p| {
			let mut cfg = test_config(p, &origin.uri(), &cas_base);
			cfg.excluded_resources = vec!["/health".to_string()];
			cfg
		},
		vec![],
	)
	.await;

	Mock::given(method("GET"))
		.and(path("/health"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.mount(&origin)
		.await;

	let resp = user_agent().get(format!("{base}/health")).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn cookies_and_redirects_come_back_in_proxy_space() {
	let origin = MockServer::start().await;
	let cas = MockServer::start().await;
	let cas_base = cas.uri();
	let origin_base = format!("{}/app", origin.uri());
	let (base, _) = serve(
		|p| {
			let mut cfg = test_config(p, &origin_base, &cas_base);
			// Exercise the pipeline without the CAS dance.
			cfg.excluded_branches = vec![String::new()];
			cfg
		},
		vec![],
	)
	.await;

	Mock::given(method("GET"))
		.and(path("/app/sub"))
		.respond_with(
			ResponseTemplate::new(200).insert_header("set-cookie", "s=1; Path=/app/sub"),
		)
		.mount(&origin)
		.await;
	Mock::given(method("GET"))
		.and(path("/app/redirect"))
		.respond_with(
			ResponseTemplate::new(302)
				.insert_header("location", format!("{}/app/next", origin.uri()).as_str()),
		)
		.mount(&origin)
		.await;

	let ua = reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.build()
		.unwrap();
	let resp = ua.get(format!("{base}/sub")).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	let cookies: Vec<&str> = resp
		.headers()
		.get_all("set-cookie")
		.iter()
		.map(|v| v.to_str().unwrap())
		.collect();
	assert!(cookies.contains(&"s=1; Path=/sub"), "got {cookies:?}");

	let resp = ua.get(format!("{base}/redirect")).send().await.unwrap();
	assert_eq!(resp.status(), 302);
	assert_eq!(
		resp.headers().get("location").unwrap().to_str().unwrap(),
		format!("{base}/next")
	);
}

mod helpers {
	use super::*;
	// `header` the module, not wiremock's matcher.
	use crate::http::header;

	#[test]
	fn websocket_upgrades_are_detected_by_token() {
		let mut h = HeaderMap::new();
		h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
		assert!(is_websocket_upgrade(&h));

		let mut h = HeaderMap::new();
		h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		h.insert(header::CONNECTION, HeaderValue::from_static("close"));
		assert!(!is_websocket_upgrade(&h));

		assert!(!is_websocket_upgrade(&HeaderMap::new()));
	}

	#[test]
	fn hop_headers_are_stripped_but_upgrades_survive() {
		let mut h = HeaderMap::new();
		h.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		h.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
		h.insert(
			HeaderName::from_static("sec-websocket-key"),
			HeaderValue::from_static("abc"),
		);
		h.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("x"));
		let upgrade = hop_by_hop_headers(&mut h);
		assert_eq!(upgrade.unwrap(), "websocket");
		assert_eq!(h.get(header::UPGRADE).unwrap(), "websocket");
		assert_eq!(h.get(header::CONNECTION).unwrap(), "upgrade");
		assert_eq!(h.get("sec-websocket-key").unwrap(), "abc");
		assert!(h.get(header::PROXY_AUTHORIZATION).is_none());
	}

	#[test]
	fn plain_requests_lose_their_connection_headers() {
		let mut h = HeaderMap::new();
		h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		h.insert(HeaderName::from_static("keep-alive"), HeaderValue::from_static("timeout=5"));
		assert_eq!(hop_by_hop_headers(&mut h), None);
		assert!(h.is_empty());
	}

	#[test]
	fn ticket_extraction_requires_exactly_one_value() {
		let uri: Uri = "/a?ticket=ST-1".parse().unwrap();
		assert_eq!(single_ticket_param(&uri).as_deref(), Some("ST-1"));
		let uri: Uri = "/a?ticket=ST-1&ticket=ST-2".parse().unwrap();
		assert_eq!(single_ticket_param(&uri), None);
		let uri: Uri = "/a?other=1".parse().unwrap();
		assert_eq!(single_ticket_param(&uri), None);
		let uri: Uri = "/a".parse().unwrap();
		assert_eq!(single_ticket_param(&uri), None);
	}

	#[test]
	fn session_cookies_round_trip() {
		let value = session_cookie("deadbeef", false);
		let mut h = HeaderMap::new();
		h.insert(header::COOKIE, value.clone());
		assert_eq!(session_id_from(&h).as_deref(), Some("deadbeef"));
		assert!(!value.to_str().unwrap().contains("Secure"));
		assert!(session_cookie("x", true).to_str().unwrap().contains("Secure"));
	}

	#[test]
	fn xml_content_types_are_recognized() {
		let mut h = HeaderMap::new();
		h.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/xml; charset=utf-8"),
		);
		assert!(has_xml_content_type(&h));
		h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		assert!(!has_xml_content_type(&h));
	}
}
