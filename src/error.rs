use hyper::StatusCode;
use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logger error: {0}")]
    Logger(#[from] log::SetLoggerError),
}

/// Why an outbound dispatch failed, as seen by the caller of the proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Dial, connect, timeout or transport failure.
    #[error("{0}")]
    Network(String),

    /// The target could not be used: bad scheme, no host, unresolvable name.
    #[error("{0}")]
    Url(String),

    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Network(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Url(_) => StatusCode::BAD_REQUEST,
            DispatchError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body sent to the client. Never contains error details.
    pub fn public_message(&self) -> &'static str {
        match self {
            DispatchError::Network(_) => "Network error occurred",
            DispatchError::Url(_) => "Invalid URL",
            DispatchError::Other(_) => "Error forwarding request",
        }
    }

    pub fn log_line(&self) -> String {
        match self {
            DispatchError::Network(detail) => format!("Network error: {}", detail),
            DispatchError::Url(detail) => format!("URL error: {}", detail),
            DispatchError::Other(detail) => format!("Error forwarding request: {}", detail),
        }
    }

    /// Classifies an error returned by the hyper-util client.
    ///
    /// Connect failures and transport errors are network errors. Errors hyper
    /// attributes to the caller (`is_user`) and anything unrecognised fall
    /// through to `Other`.
    pub fn from_client(err: hyper_util::client::legacy::Error) -> Self {
        let detail = describe(&err);
        if err.is_connect() {
            return DispatchError::Network(detail);
        }
        match find_source::<hyper::Error>(&err) {
            Some(e) if e.is_user() => DispatchError::Other(detail),
            Some(_) => DispatchError::Network(detail),
            None if find_source::<std::io::Error>(&err).is_some() => DispatchError::Network(detail),
            None => DispatchError::Other(detail),
        }
    }
}

/// Renders an error with its whole source chain, `outer: inner: root`.
pub fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(found) = cause.downcast_ref::<T>() {
            return Some(found);
        }
        source = cause.source();
    }
    None
}
