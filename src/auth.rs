use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{GatewayError, GatewayResult};

/// Claims carried by a bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub iss: String,
}

/// The authenticated caller, resolved once per request from a verified
/// credential and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub roles: Vec<String>,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Stateless bearer-credential verifier.
///
/// Verification is a pure function of the token and the process-wide signing
/// configuration; it performs no I/O and may run concurrently for unrelated
/// requests.
pub struct ClaimsVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl ClaimsVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway_secs;
        if !config.accepted_issuers.is_empty() {
            validation.set_issuer(&config.accepted_issuers);
        }
        // `sub` and `exp` are the only claims the gateway itself relies on
        validation.set_required_spec_claims(&["exp"]);

        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Verify a bearer token and extract the caller's identity.
    ///
    /// Rejects malformed tokens, bad signatures, expired tokens, and tokens
    /// from unaccepted issuers, all as `InvalidCredential`.
    pub fn verify(&self, credential: &str) -> GatewayResult<Identity> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        if token.is_empty() {
            return Err(GatewayError::MissingCredential);
        }

        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::InvalidCredential(e.to_string()))?;

        let claims = token_data.claims;
        Ok(Identity {
            subject: claims.sub,
            roles: claims.roles,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config(secret: &str) -> AuthConfig {
        AuthConfig {
            jwt_secret: secret.to_string(),
            accepted_issuers: vec!["conflux-test".to_string()],
            leeway_secs: 30,
        }
    }

    pub(crate) fn sign_token(secret: &str, sub: &str, roles: &[&str], ttl_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: now + ttl_secs,
            iat: now,
            iss: "conflux-test".to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token_and_extracts_identity() {
        let verifier = ClaimsVerifier::new(&test_config("test-secret"));
        let token = sign_token("test-secret", "user-1", &["ADMIN", "FINANCE_MANAGER"], 300);

        let identity = verifier.verify(&format!("Bearer {}", token)).unwrap();
        assert_eq!(identity.subject, "user-1");
        assert!(identity.has_role("ADMIN"));
        assert!(identity.has_role("FINANCE_MANAGER"));
        assert!(!identity.has_role("HR_MANAGER"));
    }

    #[test]
    fn rejects_token_signed_with_unknown_key() {
        let verifier = ClaimsVerifier::new(&test_config("test-secret"));
        let token = sign_token("some-other-secret", "user-1", &[], 300);

        let err = verifier.verify(&token).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential(_)));
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = ClaimsVerifier::new(&test_config("test-secret"));
        let token = sign_token("test-secret", "user-1", &[], -600);

        let err = verifier.verify(&token).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential(_)));
    }

    #[test]
    fn rejects_malformed_token() {
        let verifier = ClaimsVerifier::new(&test_config("test-secret"));
        let err = verifier.verify("Bearer not.a.jwt").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential(_)));
    }

    #[test]
    fn empty_credential_is_missing_not_invalid() {
        let verifier = ClaimsVerifier::new(&test_config("test-secret"));
        let err = verifier.verify("Bearer ").unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredential));
    }
}
