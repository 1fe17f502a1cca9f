use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    RoleToken,
    AccessToken,
    RoleCertificate,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialKind::RoleToken => "role token",
            CredentialKind::AccessToken => "access token",
            CredentialKind::RoleCertificate => "role certificate",
        };
        f.write_str(name)
    }
}

/// A credential presented by a caller, as extracted from one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    RoleToken(String),
    AccessToken {
        token: String,
        /// DER of the TLS client certificate the token was presented over.
        peer_certificate: Option<Vec<u8>>,
    },
    RoleCertificate(Vec<u8>),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::RoleToken(_) => CredentialKind::RoleToken,
            Credential::AccessToken { .. } => CredentialKind::AccessToken,
            Credential::RoleCertificate(_) => CredentialKind::RoleCertificate,
        }
    }
}
