use crate::common::{BoxError, DeadlineBody, ProxyBody};
use crate::config::Config;
use crate::error::DispatchError;
use crate::logging::ProxyLog;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::{Level, debug};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Sends a fully prepared outbound request and returns the origin's response.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, req: Request<Bytes>) -> BoxFuture<'_, Result<Response<ProxyBody>, DispatchError>>;
}

/// Shared outbound HTTP client.
///
/// One instance serves every in-flight request; the underlying hyper-util pool
/// handles its own synchronisation.
#[derive(Clone)]
pub struct OutboundClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_redirects: usize,
    log: Arc<dyn ProxyLog>,
}

impl OutboundClient {
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        max_redirects: usize,
        log: Arc<dyn ProxyLog>,
    ) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpsConnector::new_with_connector(http));

        Self {
            client,
            connect_timeout,
            request_timeout,
            max_redirects,
            log,
        }
    }

    pub fn from_config(config: &Config, log: Arc<dyn ProxyLog>) -> Self {
        Self::new(
            config.connect_timeout(),
            config.request_timeout(),
            config.max_redirects,
            log,
        )
    }

    async fn follow_redirects(&self, mut req: Request<Bytes>) -> Result<Response<Incoming>, DispatchError> {
        let mut redirects = 0;
        loop {
            let response = self.send(&req).await?;
            let next = match redirect_request(&req, &response)? {
                Some(next) => next,
                None => return Ok(response),
            };
            if redirects >= self.max_redirects {
                return Err(DispatchError::Other(format!(
                    "stopped after {} redirects",
                    self.max_redirects
                )));
            }
            redirects += 1;
            self.log.write(Level::Info, &format!("Redirecting to {}", next.uri()));
            req = next;
        }
    }

    async fn send(&self, req: &Request<Bytes>) -> Result<Response<Incoming>, DispatchError> {
        self.resolve(req.uri()).await?;

        let mut hop = Request::new(Full::new(req.body().clone()));
        *hop.method_mut() = req.method().clone();
        *hop.uri_mut() = req.uri().clone();
        *hop.headers_mut() = req.headers().clone();

        debug!("Dispatching {} {}", hop.method(), hop.uri());
        self.client.request(hop).await.map_err(DispatchError::from_client)
    }

    /// Resolves the target host up front so a name that does not resolve is
    /// reported as a URL problem rather than a connect failure.
    ///
    /// The connector resolves again when it dials, and the lookup runs even when
    /// the pool already holds a connection to the host. IP literals skip it.
    async fn resolve(&self, uri: &Uri) -> Result<(), DispatchError> {
        let (host, port) = target_host_port(uri)?;
        if is_ip_literal(&host) {
            return Ok(());
        }
        let lookup = tokio::net::lookup_host((host.as_str(), port));
        match tokio::time::timeout(self.connect_timeout, lookup).await {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    Ok(())
                } else {
                    Err(DispatchError::Url(format!("{}: no addresses found", host)))
                }
            }
            Ok(Err(e)) => Err(DispatchError::Url(format!("failed to resolve {}: {}", host, e))),
            Err(_) => Err(DispatchError::Network(format!(
                "timed out resolving {} after {:?}",
                host, self.connect_timeout
            ))),
        }
    }
}

impl Dispatch for OutboundClient {
    fn dispatch(&self, req: Request<Bytes>) -> BoxFuture<'_, Result<Response<ProxyBody>, DispatchError>> {
        Box::pin(async move {
            let deadline = Instant::now() + self.request_timeout;
            let response = match tokio::time::timeout_at(deadline, self.follow_redirects(req)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(DispatchError::Network(format!(
                        "request timed out after {:?}",
                        self.request_timeout
                    )));
                }
            };

            Ok(response.map(|body| {
                let body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed();
                DeadlineBody::new(body, deadline).boxed()
            }))
        })
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// Host and port to connect to, with IPv6 brackets removed.
pub fn target_host_port(uri: &Uri) -> Result<(String, u16), DispatchError> {
    let default_port = match uri.scheme_str() {
        Some("http") => 80,
        Some("https") => 443,
        Some(other) => {
            return Err(DispatchError::Url(format!("unsupported protocol scheme \"{}\"", other)));
        }
        None => return Err(DispatchError::Url(format!("{}: missing protocol scheme", uri))),
    };
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| DispatchError::Url(format!("{}: no host in request URL", uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, uri.port_u16().unwrap_or(default_port)))
}

/// `Host` header value for a target: host plus an explicit port, no userinfo.
pub fn host_header(uri: &Uri) -> Option<HeaderValue> {
    let host = uri.host()?;
    let value = match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).ok()
}

/// Builds the follow-up request for a redirect response, or `None` when the
/// response is final.
///
/// 301 and 302 turn POST into GET, 303 turns everything but GET and HEAD into
/// GET, and all three drop the body. 307 and 308 replay method and body.
/// Credentials are not carried to a different host.
pub fn redirect_request<B>(
    req: &Request<Bytes>,
    resp: &Response<B>,
) -> Result<Option<Request<Bytes>>, DispatchError> {
    let status = resp.status();
    let keep_body = match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => false,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
        _ => return Ok(None),
    };
    let location = match resp.headers().get(header::LOCATION) {
        Some(location) => location
            .to_str()
            .map_err(|_| DispatchError::Url("Location header is not valid UTF-8".to_string()))?,
        None => return Ok(None),
    };

    let current = Url::parse(&req.uri().to_string())
        .map_err(|e| DispatchError::Url(format!("{}: {}", req.uri(), e)))?;
    let next_url = current
        .join(location)
        .map_err(|e| DispatchError::Url(format!("failed to parse Location header {:?}: {}", location, e)))?;
    let next_uri: Uri = next_url
        .as_str()
        .parse()
        .map_err(|e| DispatchError::Url(format!("{}: {}", next_url, e)))?;

    let method = match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if req.method() == Method::POST => Method::GET,
        StatusCode::SEE_OTHER if req.method() != Method::GET && req.method() != Method::HEAD => Method::GET,
        _ => req.method().clone(),
    };

    let mut headers: HeaderMap = req.headers().clone();
    let body = if keep_body {
        req.body().clone()
    } else {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
        headers.remove(header::TRANSFER_ENCODING);
        Bytes::new()
    };
    if next_uri.host() != req.uri().host() {
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::PROXY_AUTHORIZATION);
        headers.remove(header::COOKIE);
        headers.remove(header::WWW_AUTHENTICATE);
    }
    match host_header(&next_uri) {
        Some(host) => {
            headers.insert(header::HOST, host);
        }
        None => {
            headers.remove(header::HOST);
        }
    }

    let mut next = Request::new(body);
    *next.method_mut() = method;
    *next.uri_mut() = next_uri;
    *next.headers_mut() = headers;
    Ok(Some(next))
}
