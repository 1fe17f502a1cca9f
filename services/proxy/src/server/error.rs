use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{listener} listener failed to bind {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener stopped accepting connections: {source}")]
    Accept {
        listener: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener did not drain within {timeout:?}")]
    ShutdownTimeout {
        listener: &'static str,
        timeout: Duration,
    },

    #[error("{listener} listener task panicked")]
    Panicked { listener: &'static str },

    #[error("Server canceled")]
    Canceled,
}

impl ServerError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ServerError::Canceled)
    }
}
