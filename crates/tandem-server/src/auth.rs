//! Token verification.
//!
//! Clients pass a token as the `authToken` query parameter. The server
//! resolves it to an identity before upgrading the connection.

use crate::config::AuthConfig;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tandem_core::{AuthError, PrincipalLookup, StaticTokens, TokenValidator};
use tandem_protocol::ClientIdentity;
use tracing::debug;

/// Claim URI carrying the email address in WS-Federation style tokens.
pub const WS_FED_EMAIL_CLAIM: &str =
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress";

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress")]
    ws_fed_email: Option<String>,
}

/// Verifies HS256 JWTs and maps them to identities.
///
/// `exp` is required and `nbf` honored, both with the configured leeway.
/// The identity comes from `sub` when it is a UUID, otherwise from the email
/// claim looked up through `principals`.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
    principals: Arc<dyn PrincipalLookup>,
}

impl JwtValidator {
    /// Create a validator.
    #[must_use]
    pub fn new(
        secret: impl AsRef<[u8]>,
        issuer: Option<&str>,
        audience: Option<&str>,
        leeway_secs: u64,
        principals: Arc<dyn PrincipalLookup>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.validate_nbf = true;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
            principals,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn resolve(&self, credential: &str) -> Result<ClientIdentity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = decode::<Claims>(credential, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?
            .claims;

        if let Some(identity) = claims.sub.as_deref().and_then(|sub| sub.parse().ok()) {
            return Ok(identity);
        }

        let email = claims
            .email
            .or(claims.ws_fed_email)
            .ok_or_else(|| AuthError::InvalidCredential("token names no subject".to_string()))?;

        match self.principals.identity_by_email(&email).await? {
            Some(identity) => Ok(identity),
            None => {
                debug!(email = %email, "Token subject not in directory");
                Err(AuthError::UnknownPrincipal(email))
            }
        }
    }
}

/// Build the validator selected by `config`.
#[must_use]
pub fn validator_from_config(
    config: &AuthConfig,
    principals: Arc<dyn PrincipalLookup>,
) -> Arc<dyn TokenValidator> {
    match &config.jwt_secret {
        Some(secret) => Arc::new(JwtValidator::new(
            secret.as_bytes(),
            config.issuer.as_deref(),
            config.audience.as_deref(),
            config.leeway_secs,
            principals,
        )),
        None => {
            let tokens = StaticTokens::new();
            for entry in &config.tokens {
                tokens.insert(entry.token.clone(), entry.user);
            }
            Arc::new(tokens)
        }
    }
}
