//! The transport seam: a fetch-shaped function from request to streaming response.

use std::{fmt, future::Future};

use bytes::Bytes;
use futures::{
    StreamExt, TryStreamExt,
    future::BoxFuture,
    stream::{BoxStream, Stream},
};
use http::{HeaderMap, Request, StatusCode};

use crate::error::{Result, SourceError};

/// Streaming response body. Dropping it cancels the underlying transfer.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// What a [`Fetch`] implementation hands back: status, headers and a
/// cancellable byte stream.
pub struct FetchResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<ByteStream>,
    url: Option<String>,
}

impl FetchResponse {
    /// A response without a body
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: None,
            url: None,
        }
    }

    /// Attach a streaming body
    pub fn with_body<S, B, E>(mut self, body: S) -> Self
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: Into<Bytes> + 'static,
        E: fmt::Display + 'static,
    {
        let body = body
            .map_ok(Into::into)
            .map_err(|e| SourceError::Transport(e.to_string()));
        self.body = Some(body.boxed());
        self
    }

    /// Record the final URL the response was served from
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn into_body(self) -> Option<ByteStream> {
        self.body
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Issue one request and resolve with its streaming response.
///
/// Implemented for [`ReqwestFetch`] and for any closure
/// `Fn(Request<()>) -> impl Future<Output = Result<FetchResponse>>`, so tests
/// and in-process transports can be injected without a network.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, request: Request<()>) -> BoxFuture<'static, Result<FetchResponse>>;
}

impl<F, Fut> Fetch for F
where
    F: Fn(Request<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FetchResponse>> + Send + 'static,
{
    fn fetch(&self, request: Request<()>) -> BoxFuture<'static, Result<FetchResponse>> {
        Box::pin(self(request))
    }
}

/// Default transport backed by a shared [`reqwest::Client`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetch for ReqwestFetch {
    fn fetch(&self, request: Request<()>) -> BoxFuture<'static, Result<FetchResponse>> {
        let client = self.client.clone();
        Box::pin(async move {
            let (parts, ()) = request.into_parts();
            let response = client
                .request(parts.method, parts.uri.to_string())
                .headers(parts.headers)
                .send()
                .await?;

            let url = response.url().to_string();
            Ok(FetchResponse::new(response.status(), response.headers().clone())
                .with_url(url)
                .with_body(response.bytes_stream()))
        })
    }
}
