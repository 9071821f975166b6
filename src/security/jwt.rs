use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::JwtConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub agent_id: String,
    pub machine_id: String,
    pub capabilities: Vec<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 token mint with in-place rotation and a TTL'd revocation list.
///
/// Validation is deliberately tolerant in shape: tampered, expired, and
/// revoked tokens all come back as `None` rather than distinct errors, so a
/// caller can never be talked into treating a bad token specially.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    machine_id: String,
    expiry: Duration,
    rotation_interval: Duration,
    revocation_ttl: Duration,
    revoked: Mutex<HashMap<String, Instant>>,
}

impl TokenService {
    pub fn new(secret: &str, machine_id: &str, config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            machine_id: machine_id.to_string(),
            expiry: Duration::from_millis(config.expiry_ms),
            rotation_interval: Duration::from_millis(config.rotation_interval_ms),
            revocation_ttl: Duration::from_millis(config.revocation_ttl_ms),
            revoked: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_token(&self, agent_id: &str, capabilities: &[String]) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            agent_id: agent_id.to_string(),
            machine_id: self.machine_id.clone(),
            capabilities: capabilities.to_vec(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.expiry.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("failed to sign token")
    }

    /// `None` for anything that is not a currently-good token.
    pub fn validate_token(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .ok()?
            .claims;
        if self.is_revoked(&claims.jti) {
            return None;
        }
        Some(claims)
    }

    /// Issue a replacement iff the token has aged past the rotation
    /// interval; otherwise hand the same token back. Invalid input yields
    /// `None` — the caller should mint fresh.
    pub fn refresh_token(&self, token: &str) -> Option<String> {
        let claims = self.validate_token(token)?;
        let age = Utc::now().timestamp() - claims.iat;
        if age < self.rotation_interval.as_secs() as i64 {
            return Some(token.to_string());
        }
        self.create_token(&claims.agent_id, &claims.capabilities).ok()
    }

    pub fn revoke(&self, jti: &str) {
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.insert(jti.to_string(), Instant::now());
        }
    }

    fn is_revoked(&self, jti: &str) -> bool {
        let Ok(mut revoked) = self.revoked.lock() else {
            return true;
        };
        // Entries older than the TTL would belong to expired tokens anyway.
        let ttl = self.revocation_ttl;
        revoked.retain(|_, at| at.elapsed() < ttl);
        revoked.contains_key(jti)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(rotation_ms: u64) -> TokenService {
        TokenService::new(
            "test-secret",
            "M",
            &JwtConfig {
                secret: Some("test-secret".into()),
                expiry_ms: 60_000,
                rotation_interval_ms: rotation_ms,
                revocation_ttl_ms: 60_000,
            },
        )
    }

    #[test]
    fn test_create_and_validate_roundtrip() {
        let svc = service(10_000);
        let token = svc.create_token("A1", &["chat".into()]).unwrap();
        let claims = svc.validate_token(&token).expect("token should validate");
        assert_eq!(claims.agent_id, "A1");
        assert_eq!(claims.machine_id, "M");
        assert_eq!(claims.capabilities, vec!["chat"]);
        assert!(!claims.jti.is_empty());
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let svc = service(10_000);
        let token = svc.create_token("A1", &[]).unwrap();
        let mut forged = token.clone();
        forged.pop();
        forged.push(if token.ends_with('x') { 'y' } else { 'x' });
        assert!(svc.validate_token(&forged).is_none());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let svc = service(10_000);
        let other = TokenService::new("other-secret", "M", &JwtConfig::default());
        let token = other.create_token("A1", &[]).unwrap();
        assert!(svc.validate_token(&token).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service(10_000);
        let now = Utc::now().timestamp();
        let stale = Claims {
            agent_id: "A1".into(),
            machine_id: "M".into(),
            capabilities: vec![],
            jti: "j1".into(),
            iat: now - 120,
            exp: now - 60,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &stale,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(svc.validate_token(&token).is_none());
    }

    #[test]
    fn test_revoked_jti_rejected() {
        let svc = service(10_000);
        let token = svc.create_token("A1", &[]).unwrap();
        let jti = svc.validate_token(&token).unwrap().jti;
        svc.revoke(&jti);
        assert!(svc.validate_token(&token).is_none());
    }

    #[test]
    fn test_revocation_expires_after_ttl() {
        let svc = TokenService::new(
            "test-secret",
            "M",
            &JwtConfig {
                secret: None,
                expiry_ms: 60_000,
                rotation_interval_ms: 10_000,
                revocation_ttl_ms: 10,
            },
        );
        let token = svc.create_token("A1", &[]).unwrap();
        let jti = svc.validate_token(&token).unwrap().jti;
        svc.revoke(&jti);
        assert!(svc.validate_token(&token).is_none());
        std::thread::sleep(Duration::from_millis(30));
        assert!(svc.validate_token(&token).is_some());
    }

    #[test]
    fn test_refresh_before_rotation_returns_same_token() {
        let svc = service(60_000);
        let token = svc.create_token("A1", &[]).unwrap();
        assert_eq!(svc.refresh_token(&token), Some(token));
    }

    #[test]
    fn test_refresh_after_rotation_issues_new_token() {
        let svc = service(0);
        let token = svc.create_token("A1", &["chat".into()]).unwrap();
        let refreshed = svc.refresh_token(&token).expect("refresh should succeed");
        let old = svc.validate_token(&token).unwrap();
        let new = svc.validate_token(&refreshed).unwrap();
        assert_ne!(old.jti, new.jti);
        assert_eq!(new.agent_id, "A1");
        assert_eq!(new.capabilities, vec!["chat"]);
    }

    #[test]
    fn test_refresh_of_garbage_returns_none() {
        let svc = service(10_000);
        assert!(svc.refresh_token("not-a-token").is_none());
    }
}
