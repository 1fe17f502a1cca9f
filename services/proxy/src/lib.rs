//! Authorization sidecar: verifies every inbound request against the
//! configured authorizer before relaying it to the origin over HTTP(S) or
//! gRPC.

pub mod config;
pub mod daemon;
pub mod grpc;
pub mod proxy;
pub mod server;
pub mod tls;

pub use config::SidecarConfig;
pub use daemon::{DaemonError, ProxyDaemon};
