//! HTTP plumbing shared by the backend adapters: status mapping, the
//! canonical retry classifier and client construction.

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::{self, Backoff, Classified, RetryError};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<RemoteError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemoteError::Cancelled)
    }
}

impl From<RetryError<RemoteError>> for RemoteError {
    fn from(err: RetryError<RemoteError>) -> Self {
        match err {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { attempts, last } => RemoteError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Cancelled => RemoteError::Cancelled,
        }
    }
}

/// Canonical classifier: auth, permission and not-found answers are final,
/// everything else (including a missing response) is worth another try.
pub fn classify(err: RemoteError) -> Classified<RemoteError> {
    match err {
        RemoteError::Unauthorized | RemoteError::Forbidden | RemoteError::NotFound => {
            Classified::Terminal(err)
        }
        RemoteError::Cancelled | RemoteError::Client(_) => Classified::Terminal(err),
        _ => Classified::Retriable(err),
    }
}

/// Map a non-success status to its [`RemoteError`].
pub async fn check_status(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(RemoteError::Unauthorized),
        StatusCode::FORBIDDEN => Err(RemoteError::Forbidden),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        _ => {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, %status, "failed to read error response body");
                    String::new()
                }
            };
            Err(RemoteError::Status { status, body })
        }
    }
}

/// Send a request and map the outcome, without retrying.
pub async fn send(req: RequestBuilder) -> Result<Response, RemoteError> {
    let resp = req.send().await.map_err(RemoteError::Transport)?;
    check_status(resp).await
}

/// Send a request and decode a JSON body, without retrying.
pub async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, RemoteError> {
    let resp = send(req).await?;
    resp.json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Page number announced in an `x-next-page` header; absent or empty on the last page.
pub fn next_page(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Like [`send_json`] but also returns the next page number.
pub async fn send_json_page<T: DeserializeOwned>(req: RequestBuilder) -> Result<(T, Option<u32>), RemoteError> {
    let resp = send(req).await?;
    let next = next_page(resp.headers());
    let body = resp
        .json::<T>()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok((body, next))
}

/// Retrying HTTP caller owned by an adapter.
///
/// `build` is called again for every attempt since a `RequestBuilder` is
/// consumed by sending it.
#[derive(Debug, Clone)]
pub struct Caller {
    pub http: Client,
    pub backoff: Backoff,
    pub cancel: CancellationToken,
}

impl Caller {
    pub fn new(backoff: Backoff, cancel: CancellationToken) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("token-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RemoteError::Client)?;
        Ok(Self {
            http,
            backoff,
            cancel,
        })
    }

    pub async fn json<T, F>(&self, build: F) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        retry::retry(&self.backoff, &self.cancel, classify, || {
            let req = build(&self.http);
            send_json::<T>(req)
        })
        .await
        .map_err(RemoteError::from)
    }

    /// One page of a paginated listing and the number of the page after it.
    pub async fn json_page<T, F>(&self, build: F) -> Result<(T, Option<u32>), RemoteError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        retry::retry(&self.backoff, &self.cancel, classify, || {
            let req = build(&self.http);
            send_json_page::<T>(req)
        })
        .await
        .map_err(RemoteError::from)
    }

    /// Like [`Caller::json`] but discards the body.
    pub async fn empty<F>(&self, build: F) -> Result<(), RemoteError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        retry::retry(&self.backoff, &self.cancel, classify, || {
            let req = build(&self.http);
            async move { send(req).await.map(|_| ()) }
        })
        .await
        .map_err(RemoteError::from)
    }
}
