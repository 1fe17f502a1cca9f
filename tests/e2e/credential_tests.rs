use anyhow::Result;
use authz_sidecar::{default_policy_bundle, init_test_tracing, TestHarness, ROLE_HEADER};
use reqwest::StatusCode;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn origin() -> MockServer {
    let origin = MockServer::start().await;
    Mock::given(path("/api/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data"))
        .mount(&origin)
        .await;
    origin
}

async fn harness_with(origin: &MockServer, env: &[(&str, &str)]) -> Result<TestHarness> {
    init_test_tracing();
    let mut harness = TestHarness::new()?;
    harness.use_policy_file(&default_policy_bundle())?;
    harness.use_origin(&origin.address().to_string())?;
    for (name, value) in env {
        harness.set_env(name, *value);
    }
    harness.start().await?;
    Ok(harness)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_and_foreign_role_tokens_are_rejected() -> Result<()> {
    let origin = origin().await;
    let mut harness = harness_with(&origin, &[]).await?;
    let client = harness.http_client().clone();

    let expired = harness.mint_role_token_for("user.old", authz_sidecar::DOMAIN, &["reader"], -3600);
    let foreign = harness.mint_role_token_for("user.alien", "weather", &["reader"], 3600);
    let valid = harness.mint_role_token("user.ok", &["reader"]);

    for token in [&expired, &foreign] {
        let response = client
            .get(harness.api_url("/api/data"))
            .header(ROLE_HEADER, token.as_str())
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = client
        .get(harness.api_url("/api/data"))
        .header(ROLE_HEADER, valid)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_access_tokens_follow_their_switch() -> Result<()> {
    let origin = origin().await;

    let mut disabled = harness_with(&origin, &[]).await?;
    let token = disabled.mint_access_token("client.app", &["reader"], None);
    let response = disabled
        .http_client()
        .get(disabled.api_url("/api/data"))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    disabled.shutdown().await?;

    let mut enabled = harness_with(&origin, &[("AUTHZ_ACCESS_TOKEN", "true")]).await?;
    let response = enabled
        .http_client()
        .get(enabled.api_url("/api/data"))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await?, "data");
    enabled.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bound_access_token_needs_a_client_certificate() -> Result<()> {
    let origin = origin().await;
    let mut harness = harness_with(
        &origin,
        &[
            ("AUTHZ_ACCESS_TOKEN", "true"),
            ("AUTHZ_VERIFY_CERT_THUMBPRINT", "true"),
        ],
    )
    .await?;

    let token = harness.mint_access_token("client.app", &["reader"], Some("bm90LWEtcmVhbC1jZXJ0"));
    let response = harness
        .http_client()
        .get(harness.api_url("/api/data"))
        .bearer_auth(token)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    harness.shutdown().await?;
    Ok(())
}
