use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    /// Domain every credential must belong to
    pub domain: String,

    /// Where the policy bundle is loaded from
    pub policy_source: PolicySource,

    /// Interval between background policy refreshes
    pub policy_refresh_interval: Duration,

    /// Accept role tokens
    pub role_token: bool,

    /// Accept OAuth access tokens
    pub access_token: bool,

    /// Accept role certificates from the TLS peer
    pub role_certificate: bool,

    /// Require access tokens to be bound to the presented client certificate
    pub verify_cert_thumbprint: bool,

    /// Token signing keys, required when any token kind is enabled
    pub jwt: Option<JwtConfig>,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub algorithm: JwtAlgorithm,

    /// Shared secret for HMAC algorithms
    pub secret: Option<String>,

    /// PEM public key path for RSA/ECDSA algorithms
    pub public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    Url(String),
}

impl PolicySource {
    /// Interpret `value` as an http(s) URL when it has that scheme, otherwise
    /// as a filesystem path.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            PolicySource::Url(value.to_string())
        } else {
            PolicySource::File(PathBuf::from(value))
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            PolicySource::File(path) => path.display().to_string(),
            PolicySource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JwtAlgorithm {
    HS256,
    HS384,
    HS512,
    #[default]
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
}

impl JwtAlgorithm {
    pub fn is_hmac(&self) -> bool {
        matches!(
            self,
            JwtAlgorithm::HS256 | JwtAlgorithm::HS384 | JwtAlgorithm::HS512
        )
    }
}

impl std::str::FromStr for JwtAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(JwtAlgorithm::HS256),
            "HS384" => Ok(JwtAlgorithm::HS384),
            "HS512" => Ok(JwtAlgorithm::HS512),
            "RS256" => Ok(JwtAlgorithm::RS256),
            "RS384" => Ok(JwtAlgorithm::RS384),
            "RS512" => Ok(JwtAlgorithm::RS512),
            "ES256" => Ok(JwtAlgorithm::ES256),
            "ES384" => Ok(JwtAlgorithm::ES384),
            _ => Err(format!("Unsupported JWT algorithm: {}", s)),
        }
    }
}

impl From<JwtAlgorithm> for jsonwebtoken::Algorithm {
    fn from(algorithm: JwtAlgorithm) -> Self {
        match algorithm {
            JwtAlgorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            JwtAlgorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            JwtAlgorithm::HS512 => jsonwebtoken::Algorithm::HS512,
            JwtAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            JwtAlgorithm::RS384 => jsonwebtoken::Algorithm::RS384,
            JwtAlgorithm::RS512 => jsonwebtoken::Algorithm::RS512,
            JwtAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
            JwtAlgorithm::ES384 => jsonwebtoken::Algorithm::ES384,
        }
    }
}
