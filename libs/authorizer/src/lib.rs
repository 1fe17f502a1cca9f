//! Credential verification for the authorization sidecar.
//!
//! [`Authorizer`] is the capability the proxy depends on. [`PolicyAuthorizer`]
//! implements it with JWT role/access tokens, X.509 role certificates and a
//! policy bundle that is refreshed in the background.

pub mod authorizer;
pub mod certificate;
pub mod config;
pub mod credential;
pub mod error;
pub mod policy;
pub mod principal;
pub mod token;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use authorizer::PolicyAuthorizer;
pub use certificate::certificate_thumbprint;
pub use config::{AuthorizerConfig, JwtAlgorithm, JwtConfig, PolicySource};
pub use credential::{Credential, CredentialKind};
pub use error::{AuthorizerError, ErrorCause};
pub use policy::{Effect, PolicyBundle, PolicyRule};
pub use principal::{Principal, PrincipalClaims};
pub use token::{AccessTokenClaims, Confirmation, RoleTokenClaims};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Load everything `verify` depends on. Must succeed before `start`.
    async fn init(&self, ctx: CancellationToken) -> Result<(), AuthorizerError>;

    /// Start background refresh. Errors are reported on the returned stream,
    /// which closes after `ctx` is canceled.
    fn start(&self, ctx: CancellationToken) -> mpsc::Receiver<AuthorizerError>;

    async fn verify(
        &self,
        credential: &Credential,
        method: &str,
        path: &str,
    ) -> Result<Principal, AuthorizerError>;

    /// Snapshot of the current policy cache for debugging.
    fn policy_cache(&self) -> Value;
}
