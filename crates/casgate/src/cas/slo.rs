use std::time::Duration;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

/// The SAML 2.0 protocol namespace a back-channel LogoutRequest lives under.
pub const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";

#[derive(thiserror::Error, Debug)]
pub enum SloError {
	#[error("body is not parseable XML: {0}")]
	Xml(String),
	#[error("root element is not a SAML LogoutRequest")]
	NotLogoutRequest,
	#[error("LogoutRequest has no IssueInstant attribute")]
	MissingInstant,
	#[error("unparseable IssueInstant '{0}'")]
	BadInstant(String),
	#[error("IssueInstant is more than {}s from now", .0.as_secs())]
	SkewedInstant(Duration),
	#[error("expected exactly one SessionIndex, found {0}")]
	SessionIndexCardinality(usize),
}

/// Parse a SAML `LogoutRequest` and return the service ticket named by its
/// single `SessionIndex`.
///
/// The caller treats any error as "not an SLO request" and falls through to
/// normal CAS handling; errors carry enough detail to log.
pub fn parse_logout_request(
	body: &str,
	skew: Duration,
	now: DateTime<Utc>,
) -> Result<String, SloError> {
	let mut reader = NsReader::from_str(body);
	let mut depth = 0usize;
	let mut root_seen = false;
	let mut session_indexes: Vec<String> = Vec::new();
	let mut in_session_index = false;
	let mut text = String::new();

	loop {
		let (ns, event) = reader
			.read_resolved_event()
			.map_err(|e| SloError::Xml(e.to_string()))?;
		let in_samlp = matches!(&ns, ResolveResult::Bound(b) if b.as_ref() == SAMLP_NS.as_bytes());
		let empty = matches!(&event, Event::Empty(_));
		match event {
			Event::Start(e) | Event::Empty(e) => {
				let local = e.local_name();
				if depth == 0 {
					if !(in_samlp && local.as_ref() == b"LogoutRequest") {
						return Err(SloError::NotLogoutRequest);
					}
					root_seen = true;
					let instant = e
						.try_get_attribute("IssueInstant")
						.map_err(|e| SloError::Xml(e.to_string()))?
						.ok_or(SloError::MissingInstant)?;
					let instant = instant
						.unescape_value()
						.map_err(|e| SloError::Xml(e.to_string()))?;
					check_instant(&instant, skew, now)?;
				} else if depth == 1 && in_samlp && local.as_ref() == b"SessionIndex" {
					if empty {
						session_indexes.push(String::new());
					} else {
						in_session_index = true;
						text.clear();
					}
				}
				if !empty {
					depth += 1;
				}
			},
			Event::Text(t) => {
				if in_session_index {
					let chunk = t.unescape().map_err(|e| SloError::Xml(e.to_string()))?;
					text.push_str(&chunk);
				}
			},
			Event::CData(t) => {
				if in_session_index {
					text.push_str(&String::from_utf8_lossy(&t));
				}
			},
			Event::End(_) => {
				depth -= 1;
				if in_session_index && depth == 1 {
					session_indexes.push(text.trim().to_string());
					in_session_index = false;
				}
			},
			Event::Eof => break,
			_ => {},
		}
	}

	if !root_seen {
		return Err(SloError::NotLogoutRequest);
	}
	if session_indexes.len() != 1 {
		return Err(SloError::SessionIndexCardinality(session_indexes.len()));
	}
	Ok(session_indexes.remove(0))
}

fn check_instant(raw: &str, skew: Duration, now: DateTime<Utc>) -> Result<(), SloError> {
	let instant = DateTime::parse_from_rfc3339(raw)
		.map_err(|_| SloError::BadInstant(raw.to_string()))?
		.with_timezone(&Utc);
	let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::MAX);
	if (now - instant).abs() > skew {
		return Err(SloError::SkewedInstant(
			skew.to_std().unwrap_or(Duration::MAX),
		));
	}
	Ok(())
}
