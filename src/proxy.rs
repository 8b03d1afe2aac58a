use crate::client::OutboundClient;
use crate::config::Config;
use crate::error::ProxyError;
use crate::forward_proxy::ForwardHandler;
use crate::logging::ProxyLog;
use crate::middleware::{Handler, LoggingMiddleware};
use crate::server::ProxyServer;
use log::{debug, info};
use std::sync::Arc;

/// Wires the outbound client, forwarding handler and logging middleware.
pub struct ProxyFactory;

impl ProxyFactory {
    pub fn create_handler(config: &Config, log: Arc<dyn ProxyLog>) -> Arc<dyn Handler> {
        debug!(
            "Outbound client - connect_timeout: {:?}, request_timeout: {:?}, max_redirects: {}, max_body_bytes: {}",
            config.connect_timeout(),
            config.request_timeout(),
            config.max_redirects,
            config.max_body_bytes
        );
        let client = Arc::new(OutboundClient::from_config(config, Arc::clone(&log)));
        let forward = ForwardHandler::new(
            client,
            config.request_timeout(),
            config.max_body_bytes,
            Arc::clone(&log),
        );
        Arc::new(LoggingMiddleware::new(forward, log))
    }

    pub async fn create_server(config: &Config, log: Arc<dyn ProxyLog>) -> Result<ProxyServer, ProxyError> {
        config.validate()?;
        info!("Creating forward proxy on {}", config.listen_addr);
        ProxyServer::bind(config.listen_addr, Self::create_handler(config, log)).await
    }
}
