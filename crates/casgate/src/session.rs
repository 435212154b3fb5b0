use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rand::Rng;
use tracing::{debug, info};

/// Attribute values released by CAS, keyed by attribute name. Values keep
/// their release order.
pub type Attributes = IndexMap<String, Vec<String>>;

/// Notified with `Some(attributes)` when a session is established and `None`
/// when it is destroyed.
pub type AuthInfoCallback = Arc<dyn Fn(&str, Option<&Attributes>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionRecord {
	pub username: String,
	pub ticket: String,
	pub attributes: Attributes,
	expires_at: Instant,
}

#[derive(Default)]
struct Inner {
	sessions: HashMap<String, SessionRecord>,
	// ticket -> session id; holds exactly the tickets of live sessions.
	logout_index: HashMap<String, String>,
}

/// In-memory store binding browser sessions to CAS service tickets.
///
/// A session is authenticated iff it has a record here, and its ticket is in
/// the logout index iff the session is live; both maps live behind one lock
/// so the pairing can never be observed broken.
pub struct SessionStore {
	inner: Mutex<Inner>,
	ttl: Duration,
	on_auth_info: Option<AuthInfoCallback>,
}

impl SessionStore {
	pub fn new(ttl: Duration) -> Arc<SessionStore> {
		Arc::new(SessionStore {
			inner: Mutex::new(Inner::default()),
			ttl,
			on_auth_info: None,
		})
	}

	pub fn with_auth_info_callback(ttl: Duration, cb: AuthInfoCallback) -> Arc<SessionStore> {
		Arc::new(SessionStore {
			inner: Mutex::new(Inner::default()),
			ttl,
			on_auth_info: Some(cb),
		})
	}

	pub fn new_session_id() -> String {
		format!("{:032x}", rand::rng().random::<u128>())
	}

	/// Bind a validated ticket to a session, replacing any previous binding
	/// for that session id.
	pub fn bind(&self, session_id: &str, username: &str, ticket: &str, attributes: Attributes) {
		{
			let mut inner = self.inner.lock().expect("session lock poisoned");
			if let Some(old) = inner.sessions.get(session_id).map(|s| s.ticket.clone()) {
				inner.logout_index.remove(&old);
			}
			inner.sessions.insert(
				session_id.to_string(),
				SessionRecord {
					username: username.to_string(),
					ticket: ticket.to_string(),
					attributes: attributes.clone(),
					expires_at: Instant::now() + self.ttl,
				},
			);
			inner
				.logout_index
				.insert(ticket.to_string(), session_id.to_string());
		}
		info!(session = session_id, username, "established session");
		if let Some(cb) = &self.on_auth_info {
			cb(username, Some(&attributes));
		}
	}

	/// Whether the session is live; refreshes its idle deadline.
	pub fn is_authenticated(&self, session_id: &str) -> bool {
		let mut inner = self.inner.lock().expect("session lock poisoned");
		let ttl = self.ttl;
		match inner.sessions.get_mut(session_id) {
			Some(rec) => {
				rec.expires_at = Instant::now() + ttl;
				true
			},
			None => false,
		}
	}

	pub fn username(&self, session_id: &str) -> Option<String> {
		let inner = self.inner.lock().expect("session lock poisoned");
		inner.sessions.get(session_id).map(|s| s.username.clone())
	}

	pub fn auth_info(&self, session_id: &str) -> Option<(String, Attributes)> {
		let inner = self.inner.lock().expect("session lock poisoned");
		inner
			.sessions
			.get(session_id)
			.map(|s| (s.username.clone(), s.attributes.clone()))
	}

	/// Destroy a session by id. Idempotent; also used as the expiry handler.
	pub fn destroy(&self, session_id: &str) -> bool {
		let removed = {
			let mut inner = self.inner.lock().expect("session lock poisoned");
			let Some(rec) = inner.sessions.remove(session_id) else {
				return false;
			};
			inner.logout_index.remove(&rec.ticket);
			rec
		};
		info!(
			session = session_id,
			username = removed.username,
			"destroyed session"
		);
		if let Some(cb) = &self.on_auth_info {
			cb(&removed.username, None);
		}
		true
	}

	/// Resolve a SAML `SessionIndex` ticket to a live session and destroy it.
	pub fn destroy_by_ticket(&self, ticket: &str) -> Option<String> {
		let session_id = {
			let inner = self.inner.lock().expect("session lock poisoned");
			inner.logout_index.get(ticket).cloned()
		}?;
		if self.destroy(&session_id) {
			Some(session_id)
		} else {
			None
		}
	}

	fn sweep(&self) -> Vec<String> {
		let now = Instant::now();
		let expired: Vec<String> = {
			let inner = self.inner.lock().expect("session lock poisoned");
			inner
				.sessions
				.iter()
				.filter(|(_, rec)| rec.expires_at <= now)
				.map(|(id, _)| id.clone())
				.collect()
		};
		for id in &expired {
			debug!(session = id, "session idle deadline passed");
			self.destroy(id);
		}
		expired
	}

	/// Deliver expiry events until the process drains.
	pub async fn run_expiry(self: Arc<Self>, interval: Duration) {
		let mut tick = tokio::time::interval(interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			self.sweep();
		}
	}

	#[cfg(test)]
	fn ticket_session(&self, ticket: &str) -> Option<String> {
		let inner = self.inner.lock().expect("session lock poisoned");
		inner.logout_index.get(ticket).cloned()
	}
}
