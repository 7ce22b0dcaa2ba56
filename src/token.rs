use crate::error::TokenError;
use crate::metrics::Metrics;
use crate::sas::{SecurityToken, TokenProvider};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// The floor on the renewal interval: even if a token is already close to
/// expiry, the renewer waits at least this long before trying again, so a
/// misbehaving provider handing out near-expired tokens can't spin the
/// renewal timer.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

type RenewedCallback = Arc<dyn Fn(SecurityToken) + Send + Sync>;
type ExceptionCallback = Arc<dyn Fn(&TokenError) + Send + Sync>;

/// Fetches bearer tokens from a [`TokenProvider`] and keeps them fresh:
/// each successful fetch arms a single-shot timer that re-fetches before
/// expiry and notifies `on_token_renewed`. The timer is not load-bearing
/// for correctness — any outbound use re-fetches and reconnects on
/// failure — it only exists to refresh proactively.
pub struct TokenRenewer {
	provider: Arc<dyn TokenProvider>,
	audience: String,
	min_refresh: Duration,
	metrics: Arc<Metrics>,
	timer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
	on_renewed: Mutex<Option<RenewedCallback>>,
	on_exception: Mutex<Option<ExceptionCallback>>,
}

impl TokenRenewer {
	pub fn new(provider: Arc<dyn TokenProvider>, audience: impl Into<String>, metrics: Arc<Metrics>) -> Arc<Self> {
		Arc::new(Self {
			provider,
			audience: audience.into(),
			min_refresh: MIN_REFRESH_INTERVAL,
			metrics,
			timer_task: Mutex::new(None),
			on_renewed: Mutex::new(None),
			on_exception: Mutex::new(None),
		})
	}

	#[cfg(test)]
	fn with_min_refresh(provider: Arc<dyn TokenProvider>, audience: impl Into<String>, min_refresh: Duration) -> Arc<Self> {
		Arc::new(Self {
			provider,
			audience: audience.into(),
			min_refresh,
			metrics: Arc::new(Metrics::new()),
			timer_task: Mutex::new(None),
			on_renewed: Mutex::new(None),
			on_exception: Mutex::new(None),
		})
	}

	pub fn on_token_renewed(&self, f: impl Fn(SecurityToken) + Send + Sync + 'static) {
		*self.on_renewed.lock().unwrap() = Some(Arc::new(f));
	}

	pub fn on_token_renew_exception(&self, f: impl Fn(&TokenError) + Send + Sync + 'static) {
		*self.on_exception.lock().unwrap() = Some(Arc::new(f));
	}

	/// Fetches a token now and arms the next renewal timer from it.
	pub async fn get_token(self: &Arc<Self>) -> Result<SecurityToken, TokenError> {
		match self.provider.get_token(&self.audience).await {
			Ok(token) => {
				self.metrics.token_renewals_total.inc();
				self.arm_timer(token.clone());
				Ok(token)
			},
			Err(e) => {
				self.metrics.token_renewal_failures_total.inc();
				Err(e)
			},
		}
	}

	pub fn close(&self) {
		if let Some(handle) = self.timer_task.lock().unwrap().take() {
			handle.abort();
		}
	}

	fn arm_timer(self: &Arc<Self>, token: SecurityToken) {
		let delay = token.time_until_expiry().max(self.min_refresh);
		let this = self.clone();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			match this.provider.get_token(&this.audience).await {
				Ok(new_token) => {
					this.metrics.token_renewals_total.inc();
					this.arm_timer(new_token.clone());
					if let Some(cb) = this.on_renewed.lock().unwrap().clone() {
						cb(new_token);
					}
				},
				Err(e) => {
					this.metrics.token_renewal_failures_total.inc();
					warn!(error = %e, "token renewal failed, not rearming timer");
					if let Some(cb) = this.on_exception.lock().unwrap().clone() {
						cb(&e);
					}
					// Not rearmed: the next get_token() call rearms it.
				},
			}
		});

		let mut slot = self.timer_task.lock().unwrap();
		if let Some(old) = slot.take() {
			old.abort();
		}
		*slot = Some(handle);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Instant;
	use tokio::sync::Notify;

	struct CountingProvider {
		calls: AtomicUsize,
		ttl: Duration,
	}

	#[async_trait::async_trait]
	impl TokenProvider for CountingProvider {
		async fn get_token(&self, _audience: &str) -> Result<SecurityToken, TokenError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(SecurityToken {
				token: crate::strng::new("tok"),
				expires_at: Instant::now() + self.ttl,
			})
		}
	}

	#[tokio::test(start_paused = true)]
	async fn renews_before_expiry_and_notifies_subscriber() {
		let provider = Arc::new(CountingProvider {
			calls: AtomicUsize::new(0),
			ttl: Duration::from_secs(1),
		});
		let renewer = TokenRenewer::with_min_refresh(provider.clone(), "aud", Duration::from_millis(1));
		let notified = Arc::new(Notify::new());
		let notified2 = notified.clone();
		renewer.on_token_renewed(move |_tok| {
			notified2.notify_one();
		});

		renewer.get_token().await.unwrap();
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

		tokio::time::advance(Duration::from_secs(2)).await;
		notified.notified().await;
		assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn close_cancels_the_timer() {
		let provider = Arc::new(CountingProvider {
			calls: AtomicUsize::new(0),
			ttl: Duration::from_millis(10),
		});
		let renewer = TokenRenewer::with_min_refresh(provider.clone(), "aud", Duration::from_millis(1));
		renewer.get_token().await.unwrap();
		renewer.close();
		tokio::time::sleep(Duration::from_millis(50)).await;
		// The timer was aborted before it could fire a second fetch.
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
	}
}
