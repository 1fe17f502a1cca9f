use anyhow::Result;
use authz_sidecar::{default_policy_bundle, init_test_tracing, TestHarness, ROLE_HEADER};
use reqwest::StatusCode;
use serde_json::Value;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn sidecar_for(origin: &MockServer, bypass: &str) -> Result<TestHarness> {
    init_test_tracing();
    let mut harness = TestHarness::new()?;
    harness.use_policy_file(&default_policy_bundle())?;
    harness.use_origin(&origin.address().to_string())?;
    harness.set_env("PROXY_BYPASS_PATHS", bypass);
    harness.start().await?;
    Ok(harness)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bypass_path_is_served_without_credentials() -> Result<()> {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/data"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(0)
        .mount(&origin)
        .await;

    let mut harness = sidecar_for(&origin, "/healthz").await?;
    let client = harness.http_client().clone();

    let exempt = client
        .get(harness.api_url("/healthz"))
        .header(ROLE_HEADER, "garbage")
        .send()
        .await?;
    assert_eq!(exempt.status(), StatusCode::OK);
    assert_eq!(exempt.text().await?, "pong");

    let guarded = client
        .get(harness.api_url("/api/data"))
        .header(ROLE_HEADER, "garbage")
        .send()
        .await?;
    assert_eq!(guarded.status(), StatusCode::UNAUTHORIZED);

    origin.verify().await;
    let errors = harness.shutdown().await?;
    assert!(errors.iter().all(|e| e.is_cancellation()), "{:?}", errors);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_policy_decides_per_method_and_path() -> Result<()> {
    let origin = MockServer::start().await;
    Mock::given(path("/api/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string("orders"))
        .mount(&origin)
        .await;
    Mock::given(path("/admin/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string("users"))
        .mount(&origin)
        .await;

    let mut harness = sidecar_for(&origin, "").await?;
    let client = harness.http_client().clone();
    let reader = harness.mint_role_token("user.reader", &["reader"]);
    let writer = harness.mint_role_token("user.writer", &["writer"]);
    let admin = harness.mint_role_token("user.admin", &["admin"]);

    let cases = [
        (&reader, "GET", "/api/orders", StatusCode::OK),
        (&reader, "POST", "/api/orders", StatusCode::UNAUTHORIZED),
        (&writer, "POST", "/api/orders", StatusCode::OK),
        (&writer, "DELETE", "/api/orders", StatusCode::UNAUTHORIZED),
        (&writer, "GET", "/admin/users", StatusCode::UNAUTHORIZED),
        (&admin, "DELETE", "/admin/users", StatusCode::OK),
    ];

    for (token, verb, route, expected) in cases {
        let response = client
            .request(verb.parse()?, harness.api_url(route))
            .header(ROLE_HEADER, token.as_str())
            .send()
            .await?;
        assert_eq!(response.status(), expected, "{} {}", verb, route);
    }

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_origin_sees_forwarded_headers_but_not_hop_by_hop() -> Result<()> {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/echo"))
        .and(header("x-forwarded-for", "127.0.0.1"))
        .and(header("x-request-id", "abc-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-origin", "yes")
                .set_body_string("echo"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let mut harness = sidecar_for(&origin, "").await?;
    let token = harness.mint_role_token("user.reader", &["reader"]);

    let response = harness
        .http_client()
        .get(harness.api_url("/api/echo"))
        .header(ROLE_HEADER, token)
        .header("x-request-id", "abc-123")
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-origin"], "yes");
    assert_eq!(response.text().await?, "echo");

    origin.verify().await;
    harness.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_side_listeners_expose_health_and_policy_cache() -> Result<()> {
    let origin = MockServer::start().await;
    let mut harness = sidecar_for(&origin, "").await?;
    let client = harness.http_client().clone();

    let health = client.get(harness.health_url()).send().await?;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await?, "OK");

    let not_get = client.post(harness.health_url()).send().await?;
    assert_ne!(not_get.status(), StatusCode::OK);

    let cache: Value = client.get(harness.debug_url()).send().await?.json().await?;
    assert_eq!(cache["domain"], authz_sidecar::DOMAIN);
    assert_eq!(cache["policies"].as_array().map(Vec::len), Some(4));
    assert!(cache["loaded_at"].is_string());

    harness.shutdown().await?;
    Ok(())
}
