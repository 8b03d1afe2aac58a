use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response with a fixed, generic message.
    pub fn error(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(full(message));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    pub fn bad_request() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_REQUEST, "Bad request")
    }
}

/// Fails the stream once the exchange deadline passes.
///
/// The outbound client hands this out so the overall request timeout also
/// bounds the time spent relaying the origin's body.
pub struct DeadlineBody {
    inner: ProxyBody,
    deadline: Pin<Box<Sleep>>,
}

impl DeadlineBody {
    pub fn new(inner: ProxyBody, deadline: Instant) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err("response body exceeded the request deadline".into())));
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_error_response_is_generic() {
        let response = ResponseBuilder::error(StatusCode::BAD_GATEWAY, "Network error occurred");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Network error occurred");
    }

    #[tokio::test]
    async fn test_deadline_body_passes_through_before_deadline() {
        let body = DeadlineBody::new(full("hello"), Instant::now() + Duration::from_secs(5));
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_deadline_body_fails_after_deadline() {
        let stalled =
            http_body_util::StreamBody::new(futures::stream::pending::<Result<Frame<Bytes>, BoxError>>())
                .boxed();
        let body = DeadlineBody::new(stalled, Instant::now() + Duration::from_millis(20));
        assert!(body.collect().await.is_err());
    }
}
