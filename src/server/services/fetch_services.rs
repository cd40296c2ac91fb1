use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use mockall::automock;

/// every network primitive in the proxy goes through this seam instead of a
/// concrete client, so the core can be exercised against a mock
pub type DynFetchService = Arc<dyn FetchServiceTrait + Send + Sync>;

pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct FetchError(pub String);

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest error text already names the url and the failing phase
        FetchError(e.to_string())
    }
}

pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl FetchResponse {
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: stream::once(futures::future::ready(Ok(body.into()))).boxed(),
        }
    }

    /// content-type header as owned text, empty string when missing
    pub fn content_type(&self) -> String {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    /// buffer the whole body, only used for document-mode rewriting
    pub async fn bytes(mut self) -> Result<Bytes, FetchError> {
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

#[automock]
#[async_trait]
pub trait FetchServiceTrait {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

// not end-to-end but hop-by-hop either way, none of these survive proxying
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ReqwestFetchService {
    http: reqwest::Client,
}

impl ReqwestFetchService {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FetchServiceTrait for ReqwestFetchService {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(name);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
