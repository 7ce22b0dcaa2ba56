use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectingLabels {
	pub reason: String,
}

/// Counters for the listener's lifecycle; exposed in Prometheus exposition
/// format via [`Metrics::encode`]. No HTTP exposition endpoint ships here
/// (see DESIGN.md); callers serve `encode()` however they already serve
/// their own metrics surface.
pub struct Metrics {
	registry: Registry,
	pub control_online_total: Counter,
	pub control_offline_total: Counter,
	pub control_reconnect_attempts: Family<ConnectingLabels, Counter>,
	pub accepts_total: Counter,
	pub rejects_total: Counter,
	pub requests_total: Counter,
	pub token_renewals_total: Counter,
	pub token_renewal_failures_total: Counter,
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let sub = registry.sub_registry_with_prefix("relay_listener");

		let control_online_total = Counter::default();
		sub.register("control_online", "control channel online transitions", control_online_total.clone());

		let control_offline_total = Counter::default();
		sub.register("control_offline", "control channel offline transitions", control_offline_total.clone());

		let control_reconnect_attempts = Family::<ConnectingLabels, Counter>::default();
		sub.register("control_reconnect_attempts", "reconnect attempts by failure reason", control_reconnect_attempts.clone());

		let accepts_total = Counter::default();
		sub.register("accepts", "accept commands resulting in an enqueued channel", accepts_total.clone());

		let rejects_total = Counter::default();
		sub.register("rejects", "accept commands rejected by user code", rejects_total.clone());

		let requests_total = Counter::default();
		sub.register("requests", "request commands delivered to the http bridge", requests_total.clone());

		let token_renewals_total = Counter::default();
		sub.register("token_renewals", "successful token renewals", token_renewals_total.clone());

		let token_renewal_failures_total = Counter::default();
		sub.register("token_renewal_failures", "failed token renewal attempts", token_renewal_failures_total.clone());

		Self {
			registry,
			control_online_total,
			control_offline_total,
			control_reconnect_attempts,
			accepts_total,
			rejects_total,
			requests_total,
			token_renewals_total,
			token_renewal_failures_total,
		}
	}

	pub fn encode(&self) -> String {
		let mut buffer = String::new();
		encode(&mut buffer, &self.registry).expect("prometheus encoding is infallible for this registry");
		buffer
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_registered_counters() {
		let metrics = Metrics::new();
		metrics.accepts_total.inc();
		let text = metrics.encode();
		assert!(text.contains("relay_listener_accepts_total"));
	}
}
