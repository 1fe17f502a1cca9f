use anyhow::{Context, Result};
use authz_sidecar_authorizer::{AuthorizerConfig, JwtAlgorithm, JwtConfig, PolicySource};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub authorization: AuthorizerConfig,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host for every listener
    pub host: String,

    /// API listener port
    pub port: u16,

    /// Health-check listener port, 0 disables the listener
    pub health_check_port: u16,

    pub health_check_path: String,

    pub debug_enabled: bool,

    pub debug_port: u16,

    /// Bounded graceful drain for each listener
    pub shutdown_timeout: Duration,

    /// Delay before the API listener starts draining
    pub probe_wait_time: Duration,

    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Client CA bundle, enables client certificate verification
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Grpc,
}

impl FromStr for ProxyScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "grpc" => Ok(ProxyScheme::Grpc),
            _ => anyhow::bail!("Unsupported proxy scheme: {}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,

    /// Origin host
    pub host: String,

    /// Origin port
    pub port: u16,

    /// Header (or gRPC metadata key) carrying the role token
    pub role_header: String,

    /// Buffer pool size for response copies, 0 disables pooling
    pub buffer_size: usize,

    /// Paths forwarded without authorization
    pub bypass_paths: Vec<String>,

    /// Also bypass everything below a bypass path
    pub bypass_prefix_match: bool,

    /// Per request deadline, `None` disables it
    pub request_timeout: Option<Duration>,
}

impl ProxyConfig {
    /// `host:port` of the origin
    pub fn origin_authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn origin_scheme(&self) -> &'static str {
        match self.scheme {
            ProxyScheme::Https => "https",
            ProxyScheme::Http | ProxyScheme::Grpc => "http",
        }
    }
}

impl SidecarConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let tls = TlsConfig {
            enabled: env.parse("TLS_ENABLED", false)?,
            cert_path: env.path("TLS_CERT_PATH"),
            key_path: env.path("TLS_KEY_PATH"),
            ca_path: env.path("TLS_CA_PATH"),
        };

        let server = ServerConfig {
            host: env.string("SERVER_HOST", "0.0.0.0"),
            port: env.parse("SERVER_PORT", 8082)?,
            health_check_port: env.parse("HEALTH_CHECK_PORT", 6082)?,
            health_check_path: env.string("HEALTH_CHECK_PATH", "/healthz"),
            debug_enabled: env.parse("DEBUG_ENABLED", false)?,
            debug_port: env.parse("DEBUG_PORT", 6083)?,
            shutdown_timeout: env.duration("SHUTDOWN_TIMEOUT", "5s")?,
            probe_wait_time: env.duration("PROBE_WAIT_TIME", "3s")?,
            tls,
        };

        let request_timeout = env.duration("PROXY_REQUEST_TIMEOUT", "30s")?;
        let bypass_paths = env
            .string("PROXY_BYPASS_PATHS", "")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let proxy = ProxyConfig {
            scheme: env.string("PROXY_SCHEME", "http").parse()?,
            host: env.string("PROXY_HOST", "127.0.0.1"),
            port: env.parse("PROXY_PORT", 80)?,
            role_header: env.string("PROXY_ROLE_HEADER", "Athenz-Role-Auth"),
            buffer_size: env.parse("PROXY_BUFFER_SIZE", 4096)?,
            bypass_paths,
            bypass_prefix_match: env.parse("PROXY_BYPASS_PREFIX_MATCH", true)?,
            request_timeout: (!request_timeout.is_zero()).then_some(request_timeout),
        };

        let algorithm: JwtAlgorithm = env
            .string("AUTHZ_JWT_ALGORITHM", "RS256")
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid AUTHZ_JWT_ALGORITHM")?;
        let jwt = JwtConfig {
            algorithm,
            secret: env.optional("AUTHZ_JWT_SECRET"),
            public_key_path: env.path("AUTHZ_JWT_PUBLIC_KEY_PATH"),
        };

        let role_token = env.parse("AUTHZ_ROLE_TOKEN", true)?;
        let access_token = env.parse("AUTHZ_ACCESS_TOKEN", false)?;

        let authorization = AuthorizerConfig {
            domain: env
                .optional("AUTHZ_ATHENZ_DOMAIN")
                .context("AUTHZ_ATHENZ_DOMAIN is required")?,
            policy_source: PolicySource::parse(
                &env.optional("AUTHZ_POLICY_SOURCE")
                    .context("AUTHZ_POLICY_SOURCE is required")?,
            ),
            policy_refresh_interval: env.duration("AUTHZ_POLICY_REFRESH", "30s")?,
            role_token,
            access_token,
            role_certificate: env.parse("AUTHZ_ROLE_CERT", false)?,
            verify_cert_thumbprint: env.parse("AUTHZ_VERIFY_CERT_THUMBPRINT", false)?,
            jwt: (role_token || access_token).then_some(jwt),
        };

        Ok(Self {
            server,
            proxy,
            authorization,
            log_level: env.string("LOG_LEVEL", "info"),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let tls = &self.server.tls;
        if tls.enabled {
            let cert = tls
                .cert_path
                .as_ref()
                .context("TLS_CERT_PATH is required when TLS_ENABLED is true")?;
            let key = tls
                .key_path
                .as_ref()
                .context("TLS_KEY_PATH is required when TLS_ENABLED is true")?;
            for path in [Some(cert), Some(key), tls.ca_path.as_ref()].into_iter().flatten() {
                if !path.exists() {
                    anyhow::bail!("TLS file not found: {:?}", path);
                }
            }
        }

        if self.server.shutdown_timeout.is_zero() {
            anyhow::bail!("SHUTDOWN_TIMEOUT must be greater than 0");
        }

        if self.proxy.port == 0 {
            anyhow::bail!("PROXY_PORT must be greater than 0");
        }

        if http::HeaderName::from_bytes(self.proxy.role_header.as_bytes()).is_err() {
            anyhow::bail!(
                "PROXY_ROLE_HEADER is not a valid header name: {}",
                self.proxy.role_header
            );
        }

        let authz = &self.authorization;
        if !(authz.role_token || authz.access_token || authz.role_certificate) {
            anyhow::bail!(
                "At least one of AUTHZ_ROLE_TOKEN, AUTHZ_ACCESS_TOKEN, AUTHZ_ROLE_CERT must be enabled"
            );
        }

        if authz.role_certificate && !tls.enabled {
            anyhow::bail!("AUTHZ_ROLE_CERT requires TLS_ENABLED");
        }

        if let Some(jwt) = &authz.jwt {
            if jwt.algorithm.is_hmac() {
                if jwt.secret.is_none() {
                    anyhow::bail!(
                        "AUTHZ_JWT_SECRET is required for HMAC algorithms (HS256/HS384/HS512)"
                    );
                }
            } else {
                let path = jwt.public_key_path.as_ref().context(
                    "AUTHZ_JWT_PUBLIC_KEY_PATH is required for RSA/ECDSA algorithms",
                )?;
                if !path.exists() {
                    anyhow::bail!("JWT public key file not found: {:?}", path);
                }
            }
        }

        Ok(())
    }

    /// Get the API listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(name) {
            Some(value) => value.parse().with_context(|| format!("Invalid {}", name)),
            None => Ok(default),
        }
    }

    fn duration(&self, name: &str, default: &str) -> Result<Duration> {
        humantime::parse_duration(&self.string(name, default))
            .with_context(|| format!("Invalid {}", name))
    }

    /// File paths may be given as `_NAME_`, which resolves to the value of
    /// environment variable `NAME`.
    fn path(&self, name: &str) -> Option<PathBuf> {
        let value = self.optional(name)?;
        let resolved = match value
            .strip_prefix('_')
            .and_then(|v| v.strip_suffix('_'))
            .filter(|inner| !inner.is_empty())
        {
            Some(indirect) => self.optional(indirect)?,
            None => value,
        };
        Some(PathBuf::from(resolved))
    }
}
