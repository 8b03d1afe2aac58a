//! Loopback origin and proxy helpers shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use hop_proxy::config::Config;
use hop_proxy::logging::{MemoryLog, ProxyLog};
use hop_proxy::server::ProxyServer;
use hop_proxy::ProxyFactory;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HOST, HeaderMap, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// False when the body ended in an error instead of completing.
    pub complete: bool,
}

type OriginBody = BoxBody<Bytes, Infallible>;

/// First chunk right away, then nothing.
fn trickle() -> OriginBody {
    let first = futures::stream::iter(vec![Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"first")))]);
    let stalled = futures::StreamExt::chain(first, futures::stream::pending::<Result<Frame<Bytes>, Infallible>>());
    StreamBody::new(stalled).boxed()
}

async fn origin_route(req: Request<Incoming>) -> Result<Response<OriginBody>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();

    let response = match path.as_str() {
        "/hello" => Response::builder()
            .header("x-origin", "loopback")
            .header("set-cookie", "session=1")
            .header("set-cookie", "theme=dark")
            .body(Full::new(Bytes::from_static(b"hello from origin"))),
        "/echo" => Response::builder().body(Full::new(Bytes::from(format!(
            "{} {} host={}",
            method,
            String::from_utf8_lossy(&body),
            host
        )))),
        "/missing" => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"nothing here"))),
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/hello")
            .body(Full::new(Bytes::new())),
        "/loop" => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/loop")
            .body(Full::new(Bytes::new())),
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Response::builder().body(Full::new(Bytes::from_static(b"slow")))
        }
        "/stall" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Response::builder().body(Full::new(Bytes::from_static(b"too late")))
        }
        "/trickle" => return Ok(Response::new(trickle())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    Ok(response.unwrap().map(|body| body.boxed()))
}

/// Starts an HTTP origin on an ephemeral loopback port.
pub async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_route))
                    .await;
            });
        }
    });
    addr
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config
}

/// Starts the proxy with `config`, recording its request log in the returned `MemoryLog`.
pub async fn spawn_proxy(config: Config) -> (SocketAddr, Arc<MemoryLog>) {
    let memory = Arc::new(MemoryLog::new());
    let log: Arc<dyn ProxyLog> = memory.clone();
    let handler = ProxyFactory::create_handler(&config, log);
    let server = ProxyServer::bind(config.listen_addr, handler).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    (addr, memory)
}

/// Sends one request to the proxy with `target` as the literal request target.
pub async fn send_via_proxy(proxy: SocketAddr, method: &str, target: &str, body: &str) -> Reply {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let host = target
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("localhost")
        .to_string();
    let req = Request::builder()
        .method(method)
        .uri(target)
        .header(HOST, host)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    match response.into_body().collect().await {
        Ok(collected) => Reply {
            status,
            headers,
            body: String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            complete: true,
        },
        Err(_) => Reply {
            status,
            headers,
            body: String::new(),
            complete: false,
        },
    }
}

/// Writes `raw` to the proxy and reads until the response head arrives,
/// giving up after `wait`. Returns whatever was read.
pub async fn raw_exchange(proxy: SocketAddr, raw: &str, wait: Duration) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    let _ = tokio::time::timeout(wait, async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if received.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }
    })
    .await;
    String::from_utf8_lossy(&received).into_owned()
}

/// Writes `raw` to the proxy and hangs up after `after` without reading.
pub async fn send_and_hang_up(proxy: SocketAddr, raw: &str, after: Duration) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    tokio::time::sleep(after).await;
    drop(stream);
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), condition).await
}

pub async fn eventually_within(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// An address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A listener whose accept queue is full, so further connects hang in SYN.
/// Keep both halves alive for as long as the address must stay saturated.
pub async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => held.push(stream),
            _ => break,
        }
    }
    (listener, held, addr)
}
