mod gateway;
pub mod httpproxy;

pub use gateway::Gateway;
use hyper_util::client::legacy::Error as HyperError;

use crate::cas::CasResponseError;
use crate::http::{Body, HeaderValue, Response, StatusCode, header};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("invalid request")]
	InvalidRequest,
	#[error("cas validation failed: {0}")]
	CasValidation(#[from] CasResponseError),
	#[error("access denied: {0}")]
	AccessDenied(String),
	#[error("upstream call failed: {0:?}")]
	UpstreamCallFailed(HyperError),
	#[error("interceptor failed: {0}")]
	InterceptorFailed(anyhow::Error),
	#[error("request upgrade failed, origin tried {1:?} but {0:?} was requested")]
	UpgradeFailed(Option<HeaderValue>, Option<HeaderValue>),
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
}

impl ProxyError {
	pub fn into_response(self) -> Response {
		let code = match &self {
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,

			ProxyError::CasValidation(CasResponseError::Malformed(_)) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
			ProxyError::CasValidation(CasResponseError::Denied(_)) => StatusCode::FORBIDDEN,
			ProxyError::AccessDenied(_) => StatusCode::FORBIDDEN,

			ProxyError::UpstreamCallFailed(e) if e.is_connect() => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamCallFailed(_) => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::UpgradeFailed(_, _) => StatusCode::BAD_GATEWAY,

			ProxyError::InterceptorFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let msg = self.to_string();
		::http::Response::builder()
			.status(code)
			.header(header::CONTENT_TYPE, "text/plain")
			.body(Body::from(msg))
			.expect("builder with known status code should not fail")
	}
}
