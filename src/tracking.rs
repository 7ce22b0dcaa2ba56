use crate::strng::{self, Strng};
use tracing::warn;
use uuid::Uuid;

/// Immutable correlation identity propagated into every log line and
/// outbound URL for a single control connection's lifetime. Reconnects keep
/// the same base id so logs stay correlatable across the gap.
#[derive(Clone, Debug)]
pub struct TrackingContext {
	activity_id: Uuid,
	tracking_id: Strng,
	address: Strng,
}

impl TrackingContext {
	/// Builds a fresh context for `address`, minting a new activity id.
	pub fn new(address: impl AsRef<str>) -> Self {
		let activity_id = Uuid::new_v4();
		Self {
			activity_id,
			tracking_id: strng::new(activity_id.to_string()),
			address: strng::new(address),
		}
	}

	/// Builds a context from a tracking id supplied by the service. If it
	/// doesn't parse as a UUID, a fresh UUID is generated for
	/// `activity_id` and the original string is retained verbatim as
	/// `tracking_id`.
	pub fn with_tracking_id(address: impl AsRef<str>, tracking_id: impl AsRef<str>) -> Self {
		let tracking_id = tracking_id.as_ref();
		let activity_id = match Uuid::parse_str(tracking_id) {
			Ok(id) => id,
			Err(_) => {
				warn!(tracking_id, "tracking id is not a UUID, minting a new activity id");
				Uuid::new_v4()
			},
		};
		Self {
			activity_id,
			tracking_id: strng::new(tracking_id),
			address: strng::new(address),
		}
	}

	pub fn activity_id(&self) -> Uuid {
		self.activity_id
	}

	pub fn tracking_id(&self) -> &str {
		&self.tracking_id
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	/// The portion of the tracking id before the first `_`. The relay
	/// service sometimes decorates an id with a `_Gxx` routing suffix; the
	/// base form is what gets sent back on reconnect so ids don't grow
	/// across the connection's lifetime.
    pub fn base_tracking_id(&self) -> &str {
        Self::remove_suffix(&self.tracking_id)
    }

	pub fn remove_suffix(s: &str) -> &str {
		match s.find('_') {
			Some(idx) => &s[..idx],
			None => s,
		}
	}

	/// Appends `TrackingId:<id>, Address:<addr>, Timestamp:<now>` to
	/// `message` if it doesn't already mention a tracking id, ensuring the
	/// message ends with a period first.
	pub fn ensure_trackable(&self, message: impl Into<String>) -> String {
		let mut message = message.into();
		if message.contains("TrackingId:") {
			return message;
		}
		if !message.ends_with('.') {
			message.push('.');
		}
		let now = chrono_like_timestamp();
		format!(
			"{message} TrackingId:{}, Address:{}, Timestamp:{now}",
			self.tracking_id, self.address
		)
	}
}

/// Minimal RFC3339-ish timestamp without pulling in a datetime crate: the
/// wall-clock offset from the unix epoch, which is all `ensure_trackable`'s
/// human-readable log suffix needs.
fn chrono_like_timestamp() -> String {
	let now = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default();
	format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_context_has_matching_tracking_id() {
		let ctx = TrackingContext::new("sb://ns/hc");
		assert_eq!(ctx.tracking_id(), ctx.activity_id().to_string());
	}

	#[test]
	fn invalid_uuid_retains_original_string() {
		let ctx = TrackingContext::with_tracking_id("sb://ns/hc", "not-a-uuid_G3");
		assert_eq!(ctx.tracking_id(), "not-a-uuid_G3");
		assert_eq!(ctx.base_tracking_id(), "not-a-uuid");
	}

	#[test]
	fn remove_suffix_strips_from_first_underscore() {
		assert_eq!(TrackingContext::remove_suffix("abc_G12"), "abc");
		assert_eq!(TrackingContext::remove_suffix("abc"), "abc");
	}

	#[test]
	fn ensure_trackable_appends_once() {
		let ctx = TrackingContext::new("sb://ns/hc");
		let msg = ctx.ensure_trackable("connection lost");
		assert!(msg.starts_with("connection lost."));
		assert!(msg.contains("TrackingId:"));
		assert!(msg.contains("Address:sb://ns/hc"));

		let already = ctx.ensure_trackable(format!("x TrackingId:{} done", ctx.tracking_id()));
		assert_eq!(already, format!("x TrackingId:{} done", ctx.tracking_id()));
	}
}
