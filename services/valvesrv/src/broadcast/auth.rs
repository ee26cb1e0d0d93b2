//! Subscriber token verification

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        };
        f.write_str(name)
    }
}

/// Identity attached to an authenticated subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub role: Role,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

// ============================================================================
// JWT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
    pub iat: usize,
}

/// HS256 tokens sharing a secret with the HTTP layer
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        ttl: chrono::Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            exp: (now + ttl).timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
        };
        encode(&Header::new(JWT_ALGORITHM), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let validation = Validation::new(JWT_ALGORITHM);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(Principal {
            subject: data.claims.sub,
            role: data.claims.role,
        })
    }
}

// ============================================================================
// Static tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticToken {
    pub subject: String,
    pub role: Role,
}

/// Fixed token table from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, StaticToken>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, StaticToken>) -> Self {
        Self { tokens }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .map(|t| Principal {
                subject: t.subject.clone(),
                role: t.role,
            })
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }
}

/// First verifier that accepts wins; the last error is reported
#[derive(Clone, Default)]
pub struct VerifierChain {
    verifiers: Vec<Arc<dyn TokenVerifier>>,
}

impl VerifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }
}

impl TokenVerifier for VerifierChain {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut last = AuthError::InvalidToken("no verifier configured".to_string());
        for verifier in &self.verifiers {
            match verifier.verify(token) {
                Ok(principal) => return Ok(principal),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_jwt_round_trip() {
        let verifier = JwtVerifier::new("secret");
        let token = verifier
            .issue("alice", Role::Operator, chrono::Duration::hours(1))
            .unwrap();
        let principal = verifier.verify(&token).unwrap();
        assert_eq!(principal.subject, "alice");
        assert_eq!(principal.role, Role::Operator);
    }

    #[test]
    fn test_jwt_wrong_secret_rejected() {
        let token = JwtVerifier::new("one")
            .issue("alice", Role::Admin, chrono::Duration::hours(1))
            .unwrap();
        assert!(matches!(
            JwtVerifier::new("two").verify(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_jwt_expired() {
        let verifier = JwtVerifier::new("secret");
        let token = verifier
            .issue("alice", Role::Viewer, chrono::Duration::hours(-2))
            .unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_chain_falls_through_to_static() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "kiosk".to_string(),
            StaticToken {
                subject: "lobby-display".to_string(),
                role: Role::Viewer,
            },
        );
        let chain = VerifierChain::new()
            .with(Arc::new(JwtVerifier::new("secret")))
            .with(Arc::new(StaticTokenVerifier::new(tokens)));

        assert_eq!(chain.verify("kiosk").unwrap().subject, "lobby-display");
        assert!(chain.verify("nope").is_err());
        assert!(VerifierChain::new().verify("kiosk").is_err());
    }
}
