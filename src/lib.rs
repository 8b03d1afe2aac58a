pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod forward_proxy;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use error::{DispatchError, ProxyError};
pub use proxy::ProxyFactory;
