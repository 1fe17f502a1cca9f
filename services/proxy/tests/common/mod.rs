#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use authz_sidecar_authorizer::RoleTokenClaims;
use authz_sidecar_proxy::SidecarConfig;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::net::TcpStream;

pub const SECRET: &str = "sidecar-test-secret";
pub const DOMAIN: &str = "sports";
pub const ROLE_HEADER: &str = "athenz-role-auth";

pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

pub fn write_policies(dir: &Path) -> PathBuf {
    let bundle = json!({
        "domain": DOMAIN,
        "policies": [
            { "role": "reader", "action": "GET", "resource": "/api/*", "effect": "allow" },
            { "role": "writer", "action": "*", "resource": "/api/*", "effect": "allow" },
            { "role": "writer", "action": "DELETE", "resource": "*", "effect": "deny" },
            { "role": "grpc-client", "action": "grpc", "resource": "/echo.Echo/*", "effect": "allow" }
        ]
    });
    let path = dir.join("policies.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();
    path
}

pub fn role_token(roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = RoleTokenClaims {
        sub: "user.alice".to_string(),
        d: DOMAIN.to_string(),
        r: roles.iter().map(|r| r.to_string()).collect(),
        iat: now,
        exp: now + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// Listener ports picked for one test.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    pub api: u16,
    pub health: u16,
    pub debug: u16,
}

impl Ports {
    pub fn allocate() -> Self {
        Self {
            api: unused_port(),
            health: unused_port(),
            debug: unused_port(),
        }
    }
}

/// Sidecar configuration for tests: everything on loopback, HS256 role
/// tokens, no probe wait. `overrides` win over the defaults.
pub fn sidecar_config(
    ports: Ports,
    policy_source: &str,
    overrides: &[(&str, &str)],
) -> SidecarConfig {
    let mut vars: HashMap<String, String> = [
        ("SERVER_HOST", "127.0.0.1".to_string()),
        ("SERVER_PORT", ports.api.to_string()),
        ("HEALTH_CHECK_PORT", ports.health.to_string()),
        ("DEBUG_ENABLED", "true".to_string()),
        ("DEBUG_PORT", ports.debug.to_string()),
        ("SHUTDOWN_TIMEOUT", "2s".to_string()),
        ("PROBE_WAIT_TIME", "0s".to_string()),
        ("PROXY_HOST", "127.0.0.1".to_string()),
        ("PROXY_ROLE_HEADER", ROLE_HEADER.to_string()),
        ("PROXY_REQUEST_TIMEOUT", "5s".to_string()),
        ("AUTHZ_ATHENZ_DOMAIN", DOMAIN.to_string()),
        ("AUTHZ_POLICY_SOURCE", policy_source.to_string()),
        ("AUTHZ_POLICY_REFRESH", "1h".to_string()),
        ("AUTHZ_JWT_ALGORITHM", "HS256".to_string()),
        ("AUTHZ_JWT_SECRET", SECRET.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }

    let config = SidecarConfig::from_lookup(|name| vars.get(name).cloned()).unwrap();
    config.validate().unwrap();
    config
}

/// Wait until something accepts connections on `port`.
pub async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {}", port);
}
