use std::time::Duration;

use tracing::debug;

use super::cache::PolicyBundle;
use crate::config::PolicySource;
use crate::error::AuthorizerError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads policy bundles from a file or an http(s) endpoint.
pub struct PolicyLoader {
    source: PolicySource,
    client: reqwest::Client,
}

impl PolicyLoader {
    pub fn new(source: PolicySource) -> Result<Self, AuthorizerError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| AuthorizerError::PolicyFetch {
                source_name: source.display_name(),
                class: "client".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { source, client })
    }

    pub fn source(&self) -> &PolicySource {
        &self.source
    }

    pub async fn load(&self) -> Result<PolicyBundle, AuthorizerError> {
        debug!(source = %self.source.display_name(), "Loading policy bundle");
        let bytes = match &self.source {
            PolicySource::File(path) => tokio::fs::read(path)
                .await
                .map_err(|e| self.fetch_error(format!("read {:?}", e.kind()), e.to_string()))?,
            PolicySource::Url(url) => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| self.request_error(e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(self.fetch_error(
                        format!("status {}", status.as_u16()),
                        format!("status {}", status),
                    ));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| self.request_error(e))?
                    .to_vec()
            }
        };

        PolicyBundle::from_slice(&bytes)
    }

    fn request_error(&self, err: reqwest::Error) -> AuthorizerError {
        let class = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else if err.is_body() || err.is_decode() {
            "body"
        } else {
            "request"
        };
        self.fetch_error(class.to_string(), err.to_string())
    }

    fn fetch_error(&self, class: String, message: String) -> AuthorizerError {
        AuthorizerError::PolicyFetch {
            source_name: self.source.display_name(),
            class,
            message,
        }
    }
}
