use std::time::Duration;

use anyhow::Result;
use authz_sidecar::{default_policy_bundle, init_test_tracing, TestHarness, DOMAIN, ROLE_HEADER};
use authz_sidecar_proxy::DaemonError;
use reqwest::StatusCode;
use serde_json::json;
use tokio::time::{sleep, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_bundle(server: &MockServer, bundle: serde_json::Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/policies.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle))
        .mount(server)
        .await;
}

async fn status_of(harness: &TestHarness, token: &str) -> Result<StatusCode> {
    Ok(harness
        .http_client()
        .get(harness.api_url("/api/reports"))
        .header(ROLE_HEADER, token)
        .send()
        .await?
        .status())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refreshed_policies_take_effect() -> Result<()> {
    init_test_tracing();
    let origin = MockServer::start().await;
    Mock::given(path("/api/reports"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;
    let policies = MockServer::start().await;
    serve_bundle(&policies, default_policy_bundle()).await;

    let mut harness = TestHarness::new()?;
    harness.use_origin(&origin.address().to_string())?;
    harness
        .set_env("AUTHZ_POLICY_SOURCE", format!("{}/policies.json", policies.uri()))
        .set_env("AUTHZ_POLICY_REFRESH", "100ms");
    harness.start().await?;

    let auditor = harness.mint_role_token("user.auditor", &["auditor"]);
    assert_eq!(status_of(&harness, &auditor).await?, StatusCode::UNAUTHORIZED);

    serve_bundle(
        &policies,
        json!({
            "domain": DOMAIN,
            "policies": [
                { "role": "auditor", "action": "GET", "resource": "/api/reports", "effect": "allow" }
            ]
        }),
    )
    .await;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if status_of(&harness, &auditor).await? == StatusCode::OK {
            break;
        }
        assert!(Instant::now() < deadline, "refreshed policy never applied");
        sleep(Duration::from_millis(50)).await;
    }

    let cache: serde_json::Value = harness
        .http_client()
        .get(harness.debug_url())
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(cache["policies"][0]["role"], "auditor");

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_refresh_keeps_policies_and_is_reported() -> Result<()> {
    init_test_tracing();
    let origin = MockServer::start().await;
    Mock::given(path("/api/reports"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;
    let policies = MockServer::start().await;
    serve_bundle(&policies, default_policy_bundle()).await;

    let mut harness = TestHarness::new()?;
    harness.use_origin(&origin.address().to_string())?;
    harness
        .set_env("AUTHZ_POLICY_SOURCE", format!("{}/policies.json", policies.uri()))
        .set_env("AUTHZ_POLICY_REFRESH", "50ms");
    harness.start().await?;

    Mock::given(method("GET"))
        .and(path("/policies.json"))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .mount(&policies)
        .await;
    sleep(Duration::from_millis(400)).await;

    let reader = harness.mint_role_token("user.reader", &["reader"]);
    assert_eq!(status_of(&harness, &reader).await?, StatusCode::OK);

    let errors = harness.shutdown().await?;
    let failed_refreshes = errors.iter().find_map(|e| match e {
        DaemonError::Authorizer { cause, count, .. } if cause.kind() == "policy_fetch" => {
            Some(*count)
        }
        _ => None,
    });
    assert!(
        failed_refreshes.is_some_and(|n| n >= 2),
        "expected repeated refresh failures, got {:?}",
        errors
    );
    let fetch_entries = errors
        .iter()
        .filter(|e| matches!(e, DaemonError::Authorizer { cause, .. } if cause.kind() == "policy_fetch"))
        .count();
    assert_eq!(fetch_entries, 1, "one entry per cause");
    Ok(())
}
