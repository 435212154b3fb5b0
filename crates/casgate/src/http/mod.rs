pub mod rewrite;
pub mod trust;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};

/// Buffer a request or response body fully, bounded by `limit` bytes.
pub async fn read_body(body: Body, limit: usize) -> anyhow::Result<Bytes> {
	let collected = Limited::new(body, limit)
		.collect()
		.await
		.map_err(|e| anyhow::anyhow!("failed to read body: {e}"))?;
	Ok(collected.to_bytes())
}

pub fn empty_response(status: StatusCode) -> Response {
	::http::Response::builder()
		.status(status)
		.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn redirect_response(location: &str) -> Response {
	let mut rb = ::http::Response::builder().status(StatusCode::FOUND);
	if let Ok(hv) = HeaderValue::try_from(location) {
		rb = rb.header(header::LOCATION, hv);
	}
	rb.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn json_response(value: &serde_json::Value) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(value.to_string()))
		.expect("builder with known status code should not fail")
}
