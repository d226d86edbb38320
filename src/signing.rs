//! Signed, expiring capability links for anonymous streaming.
//!
//! A link carries `path`, `expires` and `sig`, where `sig` is the lowercase
//! hex HMAC-SHA256 of `"{path}|{expires}"` under the server secret. Nothing is
//! stored: a link is valid while its signature matches and `expires` has not
//! passed. Changing the secret invalidates every outstanding link.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{MediaError, MediaResult};

type HmacSha256 = Hmac<Sha256>;

pub const PUBLIC_STREAM_ROUTE: &str = "/api/media/public/stream";

/// Query parameters of a public link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkParams {
    pub path: String,
    pub expires: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicLink {
    pub url: String,
    pub expires: i64,
}

#[derive(Clone)]
pub struct CapabilitySigner {
    secret: Vec<u8>,
}

impl CapabilitySigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signer with a fresh random secret; its links die with the process.
    pub fn ephemeral() -> Self {
        let mut secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self, resource_path: &str, expires_at: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any size");
        mac.update(resource_path.as_bytes());
        mac.update(b"|");
        mac.update(expires_at.to_string().as_bytes());
        mac
    }

    pub fn sign(&self, resource_path: &str, expires_at: i64) -> Vec<u8> {
        self.mac(resource_path, expires_at)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    pub fn sign_hex(&self, resource_path: &str, expires_at: i64) -> String {
        hex::encode(self.sign(resource_path, expires_at))
    }

    /// Constant-time signature check. Expiry is not considered here.
    pub fn verify(&self, resource_path: &str, expires_at: i64, signature: &[u8]) -> bool {
        self.mac(resource_path, expires_at)
            .verify_slice(signature)
            .is_ok()
    }

    /// Full check of link parameters at time `now` (unix seconds).
    ///
    /// Both a bad signature and an expired link yield
    /// [`MediaError::Unauthorized`].
    pub fn verify_link_at(&self, params: &LinkParams, now: i64) -> MediaResult<()> {
        let signature = hex::decode(params.sig.trim()).map_err(|_| MediaError::Unauthorized)?;
        let signature_ok = self.verify(&params.path, params.expires, &signature);
        if !signature_ok || now > params.expires {
            return Err(MediaError::Unauthorized);
        }
        Ok(())
    }

    pub fn verify_link(&self, params: &LinkParams) -> MediaResult<()> {
        self.verify_link_at(params, Utc::now().timestamp())
    }

    pub fn issue_public_link_at(
        &self,
        base_url: &str,
        resource_path: &str,
        ttl: Duration,
        now: i64,
    ) -> PublicLink {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.saturating_add(ttl);
        let sig = self.sign_hex(resource_path, expires);
        let url = format!(
            "{}{PUBLIC_STREAM_ROUTE}?path={}&expires={expires}&sig={sig}",
            base_url.trim_end_matches('/'),
            urlencoding::encode(resource_path),
        );
        PublicLink { url, expires }
    }

    pub fn issue_public_link(&self, base_url: &str, resource_path: &str, ttl: Duration) -> PublicLink {
        self.issue_public_link_at(base_url, resource_path, ttl, Utc::now().timestamp())
    }
}
