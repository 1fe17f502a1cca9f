use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::error::AuthorizerError;
use crate::principal::PrincipalClaims;

const ROLE_URI_PREFIX: &str = "athenz://role/";

/// SHA-256 thumbprint of a DER certificate, base64url without padding.
pub fn certificate_thumbprint(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(der))
}

/// Verify a role certificate and extract the principal and roles it asserts
/// within `domain`.
///
/// The subject CN names the principal. Roles come from SAN URIs of the form
/// `athenz://role/<domain>/<role>`.
pub fn verify_role_certificate(
    der: &[u8],
    domain: &str,
) -> Result<PrincipalClaims, AuthorizerError> {
    let (_, cert) = parse_x509_certificate(der)?;

    debug!("Parsing role certificate");

    if !cert.validity().is_valid() {
        return Err(AuthorizerError::CertificateExpired);
    }

    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string())
        .ok_or_else(|| AuthorizerError::InvalidCertificate("missing subject CN".to_string()))?;

    let mut roles = Vec::new();
    let mut foreign_domain = None;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| AuthorizerError::InvalidCertificate(e.to_string()))?;
    if let Some(san_ext) = san {
        for general_name in &san_ext.value.general_names {
            let GeneralName::URI(uri) = general_name else {
                continue;
            };
            let Some((role_domain, role)) = uri
                .strip_prefix(ROLE_URI_PREFIX)
                .and_then(|rest| rest.split_once('/'))
            else {
                continue;
            };
            if role_domain == domain {
                roles.push(role.to_string());
            } else if foreign_domain.is_none() {
                foreign_domain = Some(role_domain.to_string());
            }
        }
    }

    if roles.is_empty() {
        return match foreign_domain {
            Some(actual) => Err(AuthorizerError::DomainMismatch {
                expected: domain.to_string(),
                actual,
            }),
            None => {
                warn!(principal = %name, "Role certificate carries no role URIs");
                Err(AuthorizerError::InvalidCertificate(
                    "no role URI in subject alternative names".to_string(),
                ))
            }
        };
    }

    Ok(PrincipalClaims {
        name,
        roles,
        domain: domain.to_string(),
        issued_at: asn1_time(cert.validity().not_before)?,
        expires_at: asn1_time(cert.validity().not_after)?,
    })
}

fn asn1_time(time: ASN1Time) -> Result<DateTime<Utc>, AuthorizerError> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| AuthorizerError::InvalidCertificate("validity out of range".to_string()))
}
