use anyhow::Result;
use authz_sidecar::{default_policy_bundle, init_test_tracing, TestHarness, ROLE_HEADER};
use rcgen::{CertificateParams, KeyPair};
use reqwest::{Client, StatusCode};
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_listener_proxies_authorized_requests() -> Result<()> {
    init_test_tracing();
    let origin = MockServer::start().await;
    Mock::given(path("/api/secure"))
        .respond_with(ResponseTemplate::new(200).set_body_string("over tls"))
        .mount(&origin)
        .await;

    let mut harness = TestHarness::new()?;
    let key_pair = KeyPair::generate()?;
    let cert = CertificateParams::new(vec!["localhost".to_string()])?.self_signed(&key_pair)?;
    let cert_path = harness.temp_path().join("server.crt");
    let key_path = harness.temp_path().join("server.key");
    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    harness.use_policy_file(&default_policy_bundle())?;
    harness.use_origin(&origin.address().to_string())?;
    harness
        .set_env("TLS_ENABLED", "true")
        .set_env("SIDECAR_CERT", cert_path.display().to_string())
        .set_env("TLS_CERT_PATH", "_SIDECAR_CERT_")
        .set_env("TLS_KEY_PATH", key_path.display().to_string());
    harness.start().await?;

    let client = Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(true)
        .build()?;
    let url = format!("https://127.0.0.1:{}/api/secure", harness.ports().api);
    let token = harness.mint_role_token("user.reader", &["reader"]);

    let allowed = client.get(&url).header(ROLE_HEADER, token).send().await?;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(allowed.text().await?, "over tls");

    let denied = client.get(&url).send().await?;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    drop(client);
    let errors = harness.shutdown().await?;
    assert!(errors.iter().all(|e| e.is_cancellation()), "{:?}", errors);
    Ok(())
}
