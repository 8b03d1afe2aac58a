use crate::common::{BoxError, ResponseBuilder};
use crate::error::ProxyError;
use crate::middleware::Handler;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Listening side of the proxy: one tokio task per accepted connection.
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn Handler>) -> Result<Self, ProxyError> {
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped.
    pub async fn serve(self) -> Result<(), ProxyError> {
        info!("HTTP forward proxy listening on: http://{}", self.local_addr()?);

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                debug!("HTTP connection established from: {}", remote_addr);
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    async move {
                        let req = req.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed());
                        // Detached so a client hang-up does not cancel the exchange.
                        let exchange = tokio::spawn(async move { handler.call(req, remote_addr).await });
                        let response = match exchange.await {
                            Ok(response) => response,
                            Err(e) => {
                                warn!("Request task for {} failed: {}", remote_addr, e);
                                ResponseBuilder::error(StatusCode::INTERNAL_SERVER_ERROR, "Error forwarding request")
                            }
                        };
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(e) = ServerBuilder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote_addr, e);
                }
            });
        }
    }
}
