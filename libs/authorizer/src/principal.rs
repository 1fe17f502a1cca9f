use chrono::{DateTime, Utc};

use crate::credential::CredentialKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalClaims {
    pub name: String,
    pub roles: Vec<String>,
    pub domain: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Identity produced by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    RoleToken(PrincipalClaims),
    AccessToken {
        claims: PrincipalClaims,
        client_id: String,
    },
    RoleCertificate(PrincipalClaims),
}

impl Principal {
    pub fn claims(&self) -> &PrincipalClaims {
        match self {
            Principal::RoleToken(claims) | Principal::RoleCertificate(claims) => claims,
            Principal::AccessToken { claims, .. } => claims,
        }
    }

    pub fn name(&self) -> &str {
        &self.claims().name
    }

    pub fn roles(&self) -> &[String] {
        &self.claims().roles
    }

    pub fn domain(&self) -> &str {
        &self.claims().domain
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.claims().issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims().expires_at
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            Principal::AccessToken { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    pub fn credential_kind(&self) -> CredentialKind {
        match self {
            Principal::RoleToken(_) => CredentialKind::RoleToken,
            Principal::AccessToken { .. } => CredentialKind::AccessToken,
            Principal::RoleCertificate(_) => CredentialKind::RoleCertificate,
        }
    }
}
