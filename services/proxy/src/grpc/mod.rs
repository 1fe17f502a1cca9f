mod connection;
mod handler;
mod singleflight;
mod status;

pub use connection::{
    BackendConnection, CloseError, ConnectionCache, ConnectionState, DialError, Dialer, TcpDialer,
};
pub use handler::GrpcProxyHandler;
pub use singleflight::SingleFlight;
pub use status::{GrpcStatus, APPLICATION_GRPC, GRPC_MESSAGE, GRPC_STATUS};
