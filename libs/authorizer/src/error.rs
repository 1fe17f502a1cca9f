use std::fmt;

use thiserror::Error;

use crate::credential::CredentialKind;

#[derive(Debug, Clone, Error)]
pub enum AuthorizerError {
    #[error("No credential found in request")]
    MissingCredential,

    #[error("{0} verification is disabled")]
    CredentialDisabled(CredentialKind),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Certificate outside its validity window")]
    CertificateExpired,

    #[error("Access token is not bound to the presented client certificate")]
    CertificateThumbprintMismatch,

    #[error("Domain mismatch: expected {expected}, got {actual}")]
    DomainMismatch { expected: String, actual: String },

    #[error("Access denied for {principal}: {action} {resource}")]
    Forbidden {
        principal: String,
        action: String,
        resource: String,
    },

    #[error("Policy cache has not been loaded")]
    PolicyNotLoaded,

    #[error("Failed to fetch policy bundle from {source_name}: {message}")]
    PolicyFetch {
        source_name: String,
        /// Failure class used for grouping, e.g. `timeout` or `status 503`.
        class: String,
        message: String,
    },

    #[error("Invalid policy bundle: {0}")]
    PolicyParse(String),

    #[error("Invalid authorizer configuration: {0}")]
    Config(String),

    #[error("Authorizer canceled")]
    Canceled,
}

impl AuthorizerError {
    /// True for outcomes that reject a caller's credential, as opposed to
    /// failures of the authorizer's own machinery.
    pub fn is_denial(&self) -> bool {
        !matches!(
            self,
            AuthorizerError::PolicyFetch { .. }
                | AuthorizerError::PolicyParse(_)
                | AuthorizerError::Config(_)
                | AuthorizerError::Canceled
        )
    }

    /// Stable grouping key for repeated errors.
    ///
    /// Per-occurrence details such as principal names are dropped so that the
    /// same underlying failure always lands in the same bucket.
    pub fn cause(&self) -> ErrorCause {
        let (kind, detail) = match self {
            AuthorizerError::MissingCredential => ("missing_credential", String::new()),
            AuthorizerError::CredentialDisabled(kind) => ("credential_disabled", kind.to_string()),
            AuthorizerError::InvalidToken(msg) => ("invalid_token", msg.clone()),
            AuthorizerError::TokenExpired => ("token_expired", String::new()),
            AuthorizerError::InvalidCertificate(msg) => ("invalid_certificate", msg.clone()),
            AuthorizerError::CertificateExpired => ("certificate_expired", String::new()),
            AuthorizerError::CertificateThumbprintMismatch => {
                ("certificate_thumbprint_mismatch", String::new())
            }
            AuthorizerError::DomainMismatch { expected, .. } => {
                ("domain_mismatch", expected.clone())
            }
            AuthorizerError::Forbidden { .. } => ("forbidden", String::new()),
            AuthorizerError::PolicyNotLoaded => ("policy_not_loaded", String::new()),
            AuthorizerError::PolicyFetch {
                source_name, class, ..
            } => ("policy_fetch", format!("{}: {}", source_name, class)),
            AuthorizerError::PolicyParse(msg) => ("policy_parse", msg.clone()),
            AuthorizerError::Config(msg) => ("config", msg.clone()),
            AuthorizerError::Canceled => ("canceled", String::new()),
        };

        ErrorCause { kind, detail }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthorizerError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthorizerError::TokenExpired,
            _ => AuthorizerError::InvalidToken(err.to_string()),
        }
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for AuthorizerError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        match err {
            x509_parser::nom::Err::Error(e) | x509_parser::nom::Err::Failure(e) => {
                AuthorizerError::InvalidCertificate(e.to_string())
            }
            x509_parser::nom::Err::Incomplete(_) => {
                AuthorizerError::InvalidCertificate("Incomplete certificate".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCause {
    kind: &'static str,
    detail: String,
}

impl ErrorCause {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}
