use crate::client::{Dispatch, host_header};
use crate::common::{ProxyBody, ResponseBuilder};
use crate::error::DispatchError;
use crate::logging::{ProxyLog, RequestSummary, log_exchange};
use crate::middleware::Handler;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::request::Parts;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::header::{CONNECTION, HOST, HeaderMap, HeaderName};
use hyper::{Request, Response, Uri};
use log::Level;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Headers that describe the inbound connection and must not be replayed.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relays each request to the origin named by its own URL.
pub struct ForwardHandler {
    dispatcher: Arc<dyn Dispatch>,
    body_timeout: Duration,
    max_body_bytes: usize,
    log: Arc<dyn ProxyLog>,
}

impl ForwardHandler {
    pub fn new(
        dispatcher: Arc<dyn Dispatch>,
        body_timeout: Duration,
        max_body_bytes: usize,
        log: Arc<dyn ProxyLog>,
    ) -> Self {
        Self {
            dispatcher,
            body_timeout,
            max_body_bytes,
            log,
        }
    }

    pub async fn forward(&self, req: Request<ProxyBody>, remote: SocketAddr) -> Response<ProxyBody> {
        let target = match parse_target(req.uri()) {
            Ok(target) => target,
            Err(e) => {
                self.log.write(Level::Warn, &format!("Error parsing URL: {}", e));
                return ResponseBuilder::bad_request();
            }
        };

        let (parts, body) = req.into_parts();
        let body = match self.read_body(body).await {
            Ok(body) => body,
            Err(e) => return self.reject(e),
        };

        let outbound = match derive_outbound(&parts, body, &target) {
            Ok(outbound) => outbound,
            Err(e) => return self.reject(e),
        };
        let summary = RequestSummary::of(&outbound, remote);

        let response = match self.dispatcher.dispatch(outbound).await {
            Ok(response) => response,
            Err(e) => return self.reject(e),
        };

        log_exchange(self.log.as_ref(), &summary, Some(&response));
        relay_response(response)
    }

    /// Buffers the inbound body under the size cap and the request timeout.
    async fn read_body(&self, body: ProxyBody) -> Result<Bytes, DispatchError> {
        let limited = Limited::new(body, self.max_body_bytes);
        // Boxed with an explicit type so the future is provably `Send`.
        let collect: BoxFuture<'_, Result<http_body_util::Collected<Bytes>, crate::common::BoxError>> =
            Box::pin(limited.collect());
        match tokio::time::timeout(self.body_timeout, collect).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) if e.is::<LengthLimitError>() => Err(DispatchError::Other(format!(
                "request body exceeds {} bytes",
                self.max_body_bytes
            ))),
            Ok(Err(e)) => Err(DispatchError::Other(format!("failed to read request body: {}", e))),
            Err(_) => Err(DispatchError::Network(format!(
                "timed out reading request body after {:?}",
                self.body_timeout
            ))),
        }
    }

    fn reject(&self, err: DispatchError) -> Response<ProxyBody> {
        let level = match err {
            DispatchError::Other(_) => Level::Error,
            DispatchError::Network(_) | DispatchError::Url(_) => Level::Warn,
        };
        self.log.write(level, &err.log_line());
        ResponseBuilder::error(err.status(), err.public_message())
    }
}

impl Handler for ForwardHandler {
    fn call(&self, req: Request<ProxyBody>, remote: SocketAddr) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(self.forward(req, remote))
    }
}

/// Parses the request target as an absolute URL.
pub fn parse_target(uri: &Uri) -> Result<Url, url::ParseError> {
    Url::parse(&uri.to_string())
}

/// Builds the outbound request from an inbound one.
///
/// Method, headers and body carry over. The URI becomes `target`, `Host`
/// becomes the target's host, and hop-by-hop headers (plus any named in
/// `Connection`) are dropped. The inbound request is left untouched.
pub fn derive_outbound(parts: &Parts, body: Bytes, target: &Url) -> Result<Request<Bytes>, DispatchError> {
    let uri: Uri = target
        .as_str()
        .parse()
        .map_err(|e| DispatchError::Url(format!("{}: {}", target, e)))?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    match host_header(&uri) {
        Some(host) => {
            headers.insert(HOST, host);
        }
        None => {
            headers.remove(HOST);
        }
    }

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method.clone();
    *outbound.uri_mut() = uri;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Client-facing response: origin status, every end-to-end origin header value,
/// origin body.
pub fn relay_response(response: Response<ProxyBody>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let mut relayed = Response::new(body);
    copy_headers(&parts.headers, relayed.headers_mut());
    *relayed.status_mut() = parts.status;
    relayed
}

/// Appends every entry of `src` to `dst`; repeated names keep all values.
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        dst.append(name.clone(), value.clone());
    }
}
