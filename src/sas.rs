use crate::error::TokenError;
use crate::strng::{self, Strng};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A bearer token plus its expiry. `expires_at` is a monotonic [`Instant`]
/// so the renewer can arm timers without worrying about wall-clock skew;
/// the minimum refresh margin is enforced by [`TokenProvider`] callers, not
/// by this type.
#[derive(Clone, Debug)]
pub struct SecurityToken {
	pub token: Strng,
	pub expires_at: Instant,
}

impl SecurityToken {
	pub fn time_until_expiry(&self) -> Duration {
		self.expires_at.saturating_duration_since(Instant::now())
	}
}

/// External collaborator: fetches a bearer token for the relay's
/// `ServiceBusAuthorization` header. Out of scope per the purpose & scope
/// section; the crate ships one concrete SAS implementation so the rest of
/// the stack has something real to drive against.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + 'static {
	async fn get_token(&self, audience: &str) -> Result<SecurityToken, TokenError>;
}

/// Shared-access-signature provider: the standard Azure Relay / Service Bus
/// scheme, `SharedAccessSignature sr=<uri>&sig=<hmac>&se=<expiry>&skn=<name>`.
pub struct SharedAccessKeyTokenProvider {
	key_name: String,
	key: Vec<u8>,
	ttl: Duration,
}

impl SharedAccessKeyTokenProvider {
	pub fn new(key_name: impl Into<String>, key: impl Into<Vec<u8>>, ttl: Duration) -> Self {
		Self {
			key_name: key_name.into(),
			key: key.into(),
			ttl,
		}
	}
}

#[async_trait::async_trait]
impl TokenProvider for SharedAccessKeyTokenProvider {
	async fn get_token(&self, audience: &str) -> Result<SecurityToken, TokenError> {
		let encoded_uri = percent_encoding::utf8_percent_encode(
			audience,
			percent_encoding::NON_ALPHANUMERIC,
		)
		.to_string();

		let expiry = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_err(|e| TokenError::Provider(e.to_string()))?
			+ self.ttl;
		let expiry_secs = expiry.as_secs();

		let string_to_sign = format!("{encoded_uri}\n{expiry_secs}");
		let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
			.map_err(|e| TokenError::Provider(e.to_string()))?;
		mac.update(string_to_sign.as_bytes());
		let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
		let encoded_signature =
			percent_encoding::utf8_percent_encode(&signature, percent_encoding::NON_ALPHANUMERIC)
				.to_string();
		let encoded_key_name =
			percent_encoding::utf8_percent_encode(&self.key_name, percent_encoding::NON_ALPHANUMERIC)
				.to_string();

		let token = format!(
			"SharedAccessSignature sr={encoded_uri}&sig={encoded_signature}&se={expiry_secs}&skn={encoded_key_name}"
		);

		Ok(SecurityToken {
			token: strng::new(token),
			expires_at: Instant::now() + self.ttl,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn produces_well_formed_sas_token() {
		let provider =
			SharedAccessKeyTokenProvider::new("RootManageSharedAccessKey", b"supersecret".to_vec(), Duration::from_secs(3600));
		let token = provider
			.get_token("sb://ns.servicebus.windows.net/hc")
			.await
			.unwrap();
		assert!(token.token.starts_with("SharedAccessSignature sr="));
		assert!(token.token.contains("&sig="));
		assert!(token.token.contains("&se="));
		assert!(token.token.contains("&skn=RootManageSharedAccessKey"));
		assert!(token.time_until_expiry() > Duration::from_secs(3500));
	}
}
