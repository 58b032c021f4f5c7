#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use parley_util::secret::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Decimal user id.
	pub sub: String,
	pub exp: u64,
}

/// Verify a `v1.<payload>.<signature>` token and its expiry.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `user_id` valid for `ttl_secs`.
pub fn issue_hmac_token(user_id: UserId, ttl_secs: u64, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: user_id.to_string(),
		exp: unix_secs_now().saturating_add(ttl_secs),
	};

	let payload = serde_json::to_vec(&claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;

	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// How the upgrade request identifies its user.
#[derive(Debug, Clone, Default)]
pub struct UpgradeAuth {
	pub hmac_secret: Option<SecretString>,

	/// Accept a bare `?user_id=` when no secret is configured. Development only.
	pub allow_insecure_user_id: bool,
}

impl UpgradeAuth {
	/// Resolve the user id from the upgrade query string.
	pub fn identify(&self, query: Option<&str>) -> anyhow::Result<UserId> {
		let query = query.unwrap_or_default();

		if let Some(secret) = &self.hmac_secret {
			let token = query_param(query, "token").ok_or_else(|| anyhow!("missing token"))?;
			let claims = verify_hmac_token(token, secret.expose())?;
			return claims.sub.parse::<UserId>().context("token subject");
		}

		if self.allow_insecure_user_id {
			let raw = query_param(query, "user_id").ok_or_else(|| anyhow!("missing user_id"))?;
			return raw.parse::<UserId>().context("user_id");
		}

		Err(anyhow!("no authentication method configured"))
	}
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
	query
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == key)
		.map(|(_, v)| v)
		.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(n: u64) -> UserId {
		UserId::new(n).expect("user id")
	}

	#[test]
	fn issued_token_verifies() {
		let token = issue_hmac_token(uid(7), 60, "s3cret").expect("issue");
		let claims = verify_hmac_token(&token, "s3cret").expect("verify");
		assert_eq!(claims.sub, "7");
	}

	#[test]
	fn wrong_secret_and_tampering_are_rejected() {
		let token = issue_hmac_token(uid(7), 60, "s3cret").expect("issue");
		assert!(verify_hmac_token(&token, "other").is_err());

		let forged = {
			let parts: Vec<_> = token.split('.').collect();
			let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"1","exp":99999999999}"#);
			format!("v1.{payload}.{}", parts[2])
		};
		assert!(verify_hmac_token(&forged, "s3cret").is_err());
		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
	}

	#[test]
	fn expired_token_is_rejected() {
		let claims = AuthClaims {
			sub: "7".into(),
			exp: unix_secs_now() - 1,
		};
		let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("json"));
		let sig = sign(payload_b64.as_bytes(), b"s3cret").expect("sign");
		let token = format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig));

		let err = verify_hmac_token(&token, "s3cret").expect_err("expired");
		assert!(err.to_string().contains("expired"));
	}

	#[test]
	fn identify_prefers_token_when_secret_configured() {
		let auth = UpgradeAuth {
			hmac_secret: Some(SecretString::new("s3cret")),
			allow_insecure_user_id: true,
		};
		let token = issue_hmac_token(uid(3), 60, "s3cret").expect("issue");

		let query = format!("foo=bar&token={token}");
		assert_eq!(auth.identify(Some(&query)).expect("identify"), uid(3));
		assert!(auth.identify(Some("user_id=3")).is_err());
		assert!(auth.identify(None).is_err());
	}

	#[test]
	fn insecure_user_id_needs_opt_in() {
		let open = UpgradeAuth {
			hmac_secret: None,
			allow_insecure_user_id: true,
		};
		assert_eq!(open.identify(Some("user_id=12")).expect("identify"), uid(12));
		assert!(open.identify(Some("user_id=0")).is_err());
		assert!(open.identify(Some("user_id=")).is_err());

		let closed = UpgradeAuth::default();
		assert!(closed.identify(Some("user_id=12")).is_err());
	}
}
