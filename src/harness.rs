use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use authz_sidecar_authorizer::{AccessTokenClaims, Confirmation, RoleTokenClaims};
use authz_sidecar_proxy::{DaemonError, ProxyDaemon, SidecarConfig};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DOMAIN: &str = "sports";
pub const ROLE_HEADER: &str = "athenz-role-auth";
const SECRET: &str = "e2e-shared-secret";

#[derive(Debug, Clone, Copy)]
pub struct HarnessPorts {
    pub api: u16,
    pub health: u16,
    pub debug: u16,
}

impl HarnessPorts {
    pub fn allocate() -> Result<Self> {
        Ok(Self {
            api: find_free_port()?,
            health: find_free_port()?,
            debug: find_free_port()?,
        })
    }
}

struct RunningDaemon {
    ctx: CancellationToken,
    reports: mpsc::Receiver<Vec<DaemonError>>,
}

/// Runs one sidecar in-process against an origin chosen by the test.
pub struct TestHarness {
    ports: HarnessPorts,
    temp_dir: TempDir,
    http_client: Client,
    env: HashMap<String, String>,
    daemon: Option<RunningDaemon>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("creating harness temp dir")?;
        let ports = HarnessPorts::allocate()?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building reqwest client")?;

        let env = [
            ("SERVER_HOST", "127.0.0.1".to_string()),
            ("SERVER_PORT", ports.api.to_string()),
            ("HEALTH_CHECK_PORT", ports.health.to_string()),
            ("DEBUG_ENABLED", "true".to_string()),
            ("DEBUG_PORT", ports.debug.to_string()),
            ("SHUTDOWN_TIMEOUT", "2s".to_string()),
            ("PROBE_WAIT_TIME", "0s".to_string()),
            ("PROXY_ROLE_HEADER", ROLE_HEADER.to_string()),
            ("AUTHZ_ATHENZ_DOMAIN", DOMAIN.to_string()),
            ("AUTHZ_JWT_ALGORITHM", "HS256".to_string()),
            ("AUTHZ_JWT_SECRET", SECRET.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(Self {
            ports,
            temp_dir,
            http_client,
            env,
            daemon: None,
        })
    }

    pub fn ports(&self) -> &HarnessPorts {
        &self.ports
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Set an environment variable for the next `start`.
    pub fn set_env(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.env.insert(name.to_string(), value.into());
        self
    }

    /// Write `bundle` into the temp dir and use it as the policy source.
    pub fn use_policy_file(&mut self, bundle: &Value) -> Result<PathBuf> {
        let path = self.temp_dir.path().join("policies.json");
        std::fs::write(&path, serde_json::to_vec_pretty(bundle)?)
            .with_context(|| format!("writing {}", path.display()))?;
        self.set_env("AUTHZ_POLICY_SOURCE", path.display().to_string());
        Ok(path)
    }

    /// Point the sidecar at an origin given as `host:port`.
    pub fn use_origin(&mut self, authority: &str) -> Result<&mut Self> {
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("origin {} has no port", authority))?;
        self.set_env("PROXY_HOST", host);
        self.set_env("PROXY_PORT", port);
        Ok(self)
    }

    pub fn config(&self) -> Result<SidecarConfig> {
        let config = SidecarConfig::from_lookup(|name| self.env.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    /// Start the sidecar and wait for its API listener.
    pub async fn start(&mut self) -> Result<()> {
        if self.daemon.is_some() {
            return Err(anyhow!("sidecar already running"));
        }
        let daemon = ProxyDaemon::new(self.config()?)?;
        let ctx = CancellationToken::new();
        let reports = daemon.start(ctx.clone());
        self.daemon = Some(RunningDaemon { ctx, reports });

        wait_for_listener(self.ports.api, Duration::from_secs(5)).await?;
        info!(port = self.ports.api, "Sidecar started");
        Ok(())
    }

    /// Cancel the sidecar and collect what it reported.
    pub async fn shutdown(&mut self) -> Result<Vec<DaemonError>> {
        let mut running = self
            .daemon
            .take()
            .ok_or_else(|| anyhow!("sidecar is not running"))?;
        running.ctx.cancel();
        let errors = tokio::time::timeout(Duration::from_secs(15), running.reports.recv())
            .await
            .context("sidecar did not stop in time")?
            .ok_or_else(|| anyhow!("sidecar closed its report channel without reporting"))?;
        debug!(errors = errors.len(), "Sidecar stopped");
        Ok(errors)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.ports.api, path)
    }

    pub fn health_url(&self) -> String {
        let path = self
            .env
            .get("HEALTH_CHECK_PATH")
            .map(String::as_str)
            .unwrap_or("/healthz");
        format!("http://127.0.0.1:{}{}", self.ports.health, path)
    }

    pub fn debug_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}/debug/cache/policy",
            self.ports.debug
        )
    }

    pub fn mint_role_token(&self, principal: &str, roles: &[&str]) -> String {
        self.mint_role_token_for(principal, DOMAIN, roles, 3600)
    }

    /// Role token with an explicit domain and lifetime; a negative lifetime
    /// yields an expired token.
    pub fn mint_role_token_for(
        &self,
        principal: &str,
        domain: &str,
        roles: &[&str],
        lifetime_secs: i64,
    ) -> String {
        let now = Utc::now().timestamp();
        let claims = RoleTokenClaims {
            sub: principal.to_string(),
            d: domain.to_string(),
            r: roles.iter().map(|r| r.to_string()).collect(),
            iat: now.min(now + lifetime_secs),
            exp: now + lifetime_secs,
        };
        sign(&claims)
    }

    /// Access token carrying `roles` as its scope, optionally bound to a
    /// certificate thumbprint.
    pub fn mint_access_token(
        &self,
        client_id: &str,
        roles: &[&str],
        thumbprint: Option<&str>,
    ) -> String {
        let now = Utc::now().timestamp();
        let claims = AccessTokenClaims {
            sub: format!("{}.client", client_id),
            aud: DOMAIN.to_string(),
            scope: roles.join(" "),
            client_id: client_id.to_string(),
            iat: now,
            exp: now + 3600,
            cnf: thumbprint.map(|t| Confirmation {
                x5t_s256: t.to_string(),
            }),
        };
        sign(&claims)
    }
}

fn sign<T: serde::Serialize>(claims: &T) -> String {
    encode(
        &Header::new(jsonwebtoken::Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap_or_default()
}

/// Bundle used by most scenarios: readers may GET under `/api`, writers may
/// do anything there except DELETE, admins anything anywhere.
pub fn default_policy_bundle() -> Value {
    json!({
        "domain": DOMAIN,
        "policies": [
            { "role": "reader", "action": "GET", "resource": "/api/*", "effect": "allow" },
            { "role": "writer", "action": "*", "resource": "/api/*", "effect": "allow" },
            { "role": "writer", "action": "DELETE", "resource": "/api/*", "effect": "deny" },
            { "role": "admin", "action": "*", "resource": "*", "effect": "allow" }
        ]
    })
}

pub fn find_free_port() -> Result<u16> {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .context("binding to ephemeral port")?
        .local_addr()
        .context("reading socket address")?
        .port();
    Ok(port)
}

async fn wait_for_listener(port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("port {} did not open within {:?}", port, timeout));
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Route harness and sidecar logs to the test writer once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .compact()
        .try_init();
}
