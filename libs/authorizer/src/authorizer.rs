use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::certificate::verify_role_certificate;
use crate::config::AuthorizerConfig;
use crate::credential::{Credential, CredentialKind};
use crate::error::AuthorizerError;
use crate::policy::{PolicyCache, PolicyLoader};
use crate::principal::Principal;
use crate::token::TokenVerifier;
use crate::Authorizer;

const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Authorizer backed by a refreshable policy bundle.
#[derive(Clone)]
pub struct PolicyAuthorizer {
    inner: Arc<Inner>,
}

struct Inner {
    config: AuthorizerConfig,
    tokens: Option<TokenVerifier>,
    loader: PolicyLoader,
    cache: RwLock<Option<Arc<PolicyCache>>>,
}

impl PolicyAuthorizer {
    pub fn new(config: AuthorizerConfig) -> Result<Self, AuthorizerError> {
        if !(config.role_token || config.access_token || config.role_certificate) {
            return Err(AuthorizerError::Config(
                "no credential kind is enabled".to_string(),
            ));
        }

        let tokens = if config.role_token || config.access_token {
            let jwt = config.jwt.as_ref().ok_or_else(|| {
                AuthorizerError::Config("token verification requires JWT settings".to_string())
            })?;
            Some(TokenVerifier::new(jwt)?)
        } else {
            None
        };

        let loader = PolicyLoader::new(config.policy_source.clone())?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                loader,
                cache: RwLock::new(None),
            }),
        })
    }

    fn is_enabled(&self, kind: CredentialKind) -> bool {
        let config = &self.inner.config;
        match kind {
            CredentialKind::RoleToken => config.role_token,
            CredentialKind::AccessToken => config.access_token,
            CredentialKind::RoleCertificate => config.role_certificate,
        }
    }

    fn authenticate(&self, credential: &Credential) -> Result<Principal, AuthorizerError> {
        let kind = credential.kind();
        if !self.is_enabled(kind) {
            return Err(AuthorizerError::CredentialDisabled(kind));
        }

        let config = &self.inner.config;
        match credential {
            Credential::RoleToken(token) => {
                let tokens = self.token_verifier(kind)?;
                Ok(Principal::RoleToken(
                    tokens.verify_role_token(token, &config.domain)?,
                ))
            }
            Credential::AccessToken {
                token,
                peer_certificate,
            } => self.token_verifier(kind)?.verify_access_token(
                token,
                &config.domain,
                peer_certificate.as_deref(),
                config.verify_cert_thumbprint,
            ),
            Credential::RoleCertificate(der) => Ok(Principal::RoleCertificate(
                verify_role_certificate(der, &config.domain)?,
            )),
        }
    }

    fn token_verifier(&self, kind: CredentialKind) -> Result<&TokenVerifier, AuthorizerError> {
        self.inner
            .tokens
            .as_ref()
            .ok_or(AuthorizerError::CredentialDisabled(kind))
    }
}

impl Inner {
    async fn refresh(&self) -> Result<(), AuthorizerError> {
        let bundle = self.loader.load().await?;
        let cache = PolicyCache::compile(bundle, &self.config.domain)?;
        info!(
            domain = %cache.domain(),
            rules = cache.len(),
            source = %self.loader.source().display_name(),
            "Policy cache refreshed"
        );
        *self.cache.write() = Some(Arc::new(cache));
        Ok(())
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn init(&self, ctx: CancellationToken) -> Result<(), AuthorizerError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(AuthorizerError::Canceled),
            result = self.inner.refresh() => result,
        }
    }

    fn start(&self, ctx: CancellationToken) -> mpsc::Receiver<AuthorizerError> {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let period = inner.config.policy_refresh_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        debug!("Policy refresh loop canceled");
                        let _ = tx.send(AuthorizerError::Canceled).await;
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = inner.refresh().await {
                            warn!(error = %err, "Policy refresh failed, keeping previous cache");
                            if tx.send(err).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        rx
    }

    #[instrument(skip(self, credential), fields(kind = %credential.kind()))]
    async fn verify(
        &self,
        credential: &Credential,
        method: &str,
        path: &str,
    ) -> Result<Principal, AuthorizerError> {
        let principal = self.authenticate(credential)?;

        let cache = self
            .inner
            .cache
            .read()
            .clone()
            .ok_or(AuthorizerError::PolicyNotLoaded)?;

        if !cache.is_allowed(principal.roles(), method, path) {
            debug!(principal = %principal.name(), "No policy grants access");
            return Err(AuthorizerError::Forbidden {
                principal: principal.name().to_string(),
                action: method.to_string(),
                resource: path.to_string(),
            });
        }

        debug!(principal = %principal.name(), "Request authorized");
        Ok(principal)
    }

    fn policy_cache(&self) -> Value {
        match self.inner.cache.read().as_ref() {
            Some(cache) => cache.to_json(),
            None => json!({}),
        }
    }
}
