use crate::common::{BoxError, ProxyBody};
use crate::logging::{ProxyLog, timestamp};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Request, Response};
use log::Level;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Anything that turns an inbound request into a response.
pub trait Handler: Send + Sync {
    fn call(&self, req: Request<ProxyBody>, remote: SocketAddr) -> BoxFuture<'_, Response<ProxyBody>>;
}

/// Logs every request on the way in and its duration on the way out.
///
/// The closing line is written when the server lets go of the response body,
/// so the measured time includes streaming the body to the client.
pub struct LoggingMiddleware<H> {
    inner: H,
    log: Arc<dyn ProxyLog>,
}

impl<H: Handler> LoggingMiddleware<H> {
    pub fn new(inner: H, log: Arc<dyn ProxyLog>) -> Self {
        Self { inner, log }
    }
}

impl<H: Handler> Handler for LoggingMiddleware<H> {
    fn call(&self, req: Request<ProxyBody>, remote: SocketAddr) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(async move {
            let started = Instant::now();
            let stamp = timestamp();
            self.log.write(
                Level::Info,
                &format!("[{}] {} {} {}", stamp, req.method(), req.uri(), remote),
            );

            let response = self.inner.call(req, remote).await;

            let log = Arc::clone(&self.log);
            response.map(|body| TimedBody::new(body, log, stamp, started).boxed())
        })
    }
}

/// Response body that reports the request duration once it is released.
struct TimedBody {
    inner: ProxyBody,
    log: Arc<dyn ProxyLog>,
    stamp: String,
    started: Instant,
}

impl TimedBody {
    fn new(inner: ProxyBody, log: Arc<dyn ProxyLog>, stamp: String, started: Instant) -> Self {
        Self {
            inner,
            log,
            stamp,
            started,
        }
    }
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TimedBody {
    fn drop(&mut self) {
        self.log.write(
            Level::Info,
            &format!("[{}] Request took {:?}", self.stamp, self.started.elapsed()),
        );
    }
}
