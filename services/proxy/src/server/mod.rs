mod coordinator;
pub mod debug;
mod error;
pub mod health;
mod listener;

pub use coordinator::Server;
pub use error::ServerError;
pub use listener::{HttpListener, PeerInfo};
