use std::fs;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::certificate::certificate_thumbprint;
use crate::config::JwtConfig;
use crate::error::AuthorizerError;
use crate::principal::{Principal, PrincipalClaims};

/// Claims carried by a role token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTokenClaims {
    pub sub: String,
    /// Domain
    pub d: String,
    /// Roles granted within the domain
    pub r: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Claims carried by an OAuth2 access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub aud: String,
    /// Space separated role names
    #[serde(default)]
    pub scope: String,
    pub client_id: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

/// Certificate binding of an access token (RFC 8705).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
}

pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &JwtConfig) -> Result<Self, AuthorizerError> {
        let algorithm: Algorithm = config.algorithm.into();

        let decoding_key = if config.algorithm.is_hmac() {
            let secret = config.secret.as_ref().ok_or_else(|| {
                AuthorizerError::Config("JWT secret missing for HMAC algorithm".to_string())
            })?;
            DecodingKey::from_secret(secret.as_bytes())
        } else {
            let key_path = config.public_key_path.as_ref().ok_or_else(|| {
                AuthorizerError::Config(
                    "JWT public key path missing for RSA/ECDSA algorithm".to_string(),
                )
            })?;
            let key_data = fs::read(key_path).map_err(|e| {
                AuthorizerError::Config(format!(
                    "Failed to read public key {}: {}",
                    key_path.display(),
                    e
                ))
            })?;
            match algorithm {
                Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(&key_data)?,
                _ => DecodingKey::from_rsa_pem(&key_data)?,
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![algorithm];
        // Audience carries the domain and is compared explicitly so that a
        // mismatch is reported as such.
        validation.validate_aud = false;

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn verify_role_token(
        &self,
        token: &str,
        domain: &str,
    ) -> Result<PrincipalClaims, AuthorizerError> {
        debug!("Decoding role token");
        let claims = decode::<RoleTokenClaims>(token, &self.decoding_key, &self.validation)?.claims;

        if claims.d != domain {
            return Err(AuthorizerError::DomainMismatch {
                expected: domain.to_string(),
                actual: claims.d,
            });
        }

        Ok(PrincipalClaims {
            name: claims.sub,
            roles: claims.r,
            domain: claims.d,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }

    pub fn verify_access_token(
        &self,
        token: &str,
        domain: &str,
        peer_certificate: Option<&[u8]>,
        verify_thumbprint: bool,
    ) -> Result<Principal, AuthorizerError> {
        debug!("Decoding access token");
        let claims =
            decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)?.claims;

        if claims.aud != domain {
            return Err(AuthorizerError::DomainMismatch {
                expected: domain.to_string(),
                actual: claims.aud,
            });
        }

        if verify_thumbprint {
            let bound = claims
                .cnf
                .as_ref()
                .ok_or(AuthorizerError::CertificateThumbprintMismatch)?;
            let cert = peer_certificate.ok_or(AuthorizerError::CertificateThumbprintMismatch)?;
            if certificate_thumbprint(cert) != bound.x5t_s256 {
                return Err(AuthorizerError::CertificateThumbprintMismatch);
            }
        }

        let roles = claims
            .scope
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        Ok(Principal::AccessToken {
            claims: PrincipalClaims {
                name: claims.sub,
                roles,
                domain: claims.aud,
                issued_at: timestamp(claims.iat)?,
                expires_at: timestamp(claims.exp)?,
            },
            client_id: claims.client_id,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AuthorizerError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AuthorizerError::InvalidToken(format!("Invalid timestamp: {}", secs)))
}
