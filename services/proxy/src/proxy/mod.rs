mod buffer_pool;
mod bypass;
mod error;
mod handler;
mod pooled_body;
mod transport;

pub use buffer_pool::BufferPool;
pub use bypass::BypassMatcher;
pub use error::ProxyError;
pub use handler::ReverseProxy;
pub use pooled_body::PooledBody;
pub use transport::{extract_credential, AuthorizingTransport, HyperTransport, Transport};
