use std::time::Duration;

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    /// Tenant identity used to look up the ledger binding.
    pub tenant_id: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway: Duration,
    pub principal_id_claim: String,
    pub tenant_claim: String,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_AUTH_INVALID",
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Verifies HS256 bearer tokens issued by the portal login flow.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    principal_id_claim: String,
    tenant_claim: String,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("principal_id_claim", &self.principal_id_claim)
            .field("tenant_claim", &self.tenant_claim)
            .finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    pub fn new(config: JwtConfig) -> Result<Self, AuthError> {
        if config.secret.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt secret must be non-empty".to_string(),
            });
        }

        for (name, claim) in [
            ("principal_id_claim", &config.principal_id_claim),
            ("tenant_claim", &config.tenant_claim),
        ] {
            if claim.trim().is_empty() {
                return Err(AuthError {
                    code: "ERR_INVALID_CONFIG",
                    message: format!("jwt {} must be non-empty", name),
                });
            }
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway.as_secs();
        if let Some(issuer) = config.issuer.as_ref() {
            validation.set_issuer(std::slice::from_ref(issuer));
        }
        match config.audience.as_ref() {
            Some(audience) => validation.set_audience(std::slice::from_ref(audience)),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            principal_id_claim: config.principal_id_claim,
            tenant_claim: config.tenant_claim,
        })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let header =
            decode_header(&token).map_err(|_| AuthError::invalid("invalid JWT header"))?;
        if header.alg != Algorithm::HS256 {
            return Err(AuthError::invalid("unsupported JWT alg (expected HS256)"));
        }

        let claims = decode::<Value>(&token, &self.key, &self.validation)
            .map_err(|_| AuthError::invalid("JWT validation failed"))?
            .claims;

        let tenant_id = claim_string(&claims, &self.tenant_claim)?;
        let principal_id = match claim_string(&claims, &self.principal_id_claim) {
            Ok(id) => id,
            Err(_) if self.principal_id_claim != self.tenant_claim => tenant_id.clone(),
            Err(err) => return Err(err),
        };

        Ok(Principal {
            principal_id,
            tenant_id,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization header".to_string(),
        })?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError::invalid("Authorization must be a Bearer token"))?;

    if token.trim().is_empty() {
        return Err(AuthError::invalid("Bearer token is empty"));
    }

    Ok(token.trim().to_string())
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AuthError::invalid(format!(
                "required claim `{}` is missing or not a string",
                claim
            ))
        })
}
