// src/proxy/mod.rs
mod backend;
mod connector;
mod pool;
mod proxy;

pub use backend::Backend;
pub use connector::{Connector, TcpConnector};
pub use pool::BackendPool;
pub use proxy::{Proxy, ProxyError, X_BYTES};
