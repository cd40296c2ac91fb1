use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, warn};

use super::fetch_services::{BodyStream, DynFetchService, FetchError, FetchRequest};
use super::rewrite_services;

/// fixed desktop browser identity for every upstream request, embed hosts
/// refuse anything that looks like a server-side client
pub const FORCED_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// the only inbound headers forwarded upstream
const FORWARDED_REQUEST_HEADERS: [HeaderName; 4] = [
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
    header::RANGE,
];

/// framing headers that would stop the page from rendering inside our origin
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = [
    "content-security-policy",
    "x-frame-options",
    "frame-options",
];

/// allowed content-type fragments for /_next/static assets
const VALID_STATIC_ASSET_TYPES: [&str; 6] = [
    "text/javascript",
    "application/javascript",
    "text/css",
    "image/",
    "font/",
    "application/json",
];

static ASSET_CONTENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "(javascript|css|font|image|octet-stream|svg|woff|woff2|json|m3u8|mp4|webm|wasm|jpg|jpeg|png|gif|bmp|tiff|webp|xyz|ico)",
    )
    .expect("static pattern should compile")
});

static CHARSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)charset=([^;]+)").expect("static pattern should compile"));

/// response value type the proxy core hands back to whatever HTTP surface is
/// hosting it - controllers turn it into an axum response at the edge
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

pub enum ProxyBody {
    Empty,
    Text(String),
    Stream(BodyStream),
}

impl ProxyResponse {
    /// plain-text response with the CORS header every response carries
    pub fn plain(status: StatusCode, message: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Self {
            status,
            headers,
            body: ProxyBody::Text(message.into()),
        }
    }

    pub fn html(status: StatusCode, markup: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        Self {
            status,
            headers,
            body: ProxyBody::Text(markup.into()),
        }
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            ProxyBody::Empty => Body::empty(),
            ProxyBody::Text(text) => Body::from(text),
            ProxyBody::Stream(stream) => Body::from_stream(stream),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// the slice of the inbound request proxy_fetch is allowed to see
pub struct InboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
}

pub type DynProxyService = Arc<dyn ProxyServiceTrait + Send + Sync>;

#[async_trait]
pub trait ProxyServiceTrait {
    /// fetch `target_url` on behalf of the inbound request. Document mode
    /// (`rewrite_assets = true`) decodes and rewrites HTML; asset mode gates
    /// the content-type and streams bytes through unchanged. Transport errors
    /// from the upstream fetch are the only Err case - content-policy
    /// violations come back as regular responses (415/404).
    async fn proxy_fetch(
        &self,
        target_url: &str,
        inbound: InboundRequest,
        custom_headers: HashMap<String, String>,
        rewrite_assets: bool,
    ) -> Result<ProxyResponse, FetchError>;
}

pub struct ProxyService {
    fetch: DynFetchService,
}

impl ProxyService {
    pub fn new(fetch: DynFetchService) -> Self {
        Self { fetch }
    }

    fn build_upstream_request(
        target_url: &str,
        inbound: &InboundRequest,
        custom_headers: &HashMap<String, String>,
        rewrite_assets: bool,
    ) -> FetchRequest {
        let mut upstream = FetchRequest::new(inbound.method.clone(), target_url);

        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = inbound.headers.get(&name) {
                upstream.headers.insert(name, value.clone());
            }
        }

        for (key, value) in custom_headers {
            match (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    upstream.headers.insert(name, value);
                }
                _ => warn!("skipping unusable override header: {}", key),
            }
        }

        upstream.headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(FORCED_USER_AGENT),
        );
        upstream
            .headers
            .insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        if rewrite_assets {
            // only codings we can undo ourselves - the body has to come out
            // as readable markup before the rewrite passes run
            upstream.headers.insert(
                header::ACCEPT_ENCODING,
                HeaderValue::from_static("gzip, zstd"),
            );
        }

        upstream
    }

    fn decompress(raw: &[u8], content_encoding: Option<&str>) -> Vec<u8> {
        match content_encoding {
            Some("zstd") => zstd::decode_all(raw).unwrap_or_else(|e| {
                warn!("failed to decompress zstd document, using raw bytes: {}", e);
                raw.to_vec()
            }),
            Some("gzip") => {
                let mut decoder = GzDecoder::new(raw);
                let mut decompressed = Vec::new();
                match decoder.read_to_end(&mut decompressed) {
                    Ok(_) => decompressed,
                    Err(e) => {
                        warn!("failed to decompress gzip document, using raw bytes: {}", e);
                        raw.to_vec()
                    }
                }
            }
            _ => raw.to_vec(),
        }
    }

    /// decode with the charset the upstream declared, utf-8 when it didn't.
    /// encoding_rs substitutes replacement characters instead of failing, so a
    /// mangled document degrades to mangled text rather than an error.
    fn decode_declared_charset(raw: &[u8], content_type: &str) -> String {
        let label = CHARSET_RE
            .captures(content_type)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| "utf-8".to_string());

        let encoding =
            encoding_rs::Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::UTF_8);

        let (text, _, had_errors) = encoding.decode(raw);
        if had_errors {
            warn!("document did not fully decode as {}", label);
        }
        text.into_owned()
    }

    fn apply_cors(headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        );
    }
}

#[async_trait]
impl ProxyServiceTrait for ProxyService {
    async fn proxy_fetch(
        &self,
        target_url: &str,
        inbound: InboundRequest,
        custom_headers: HashMap<String, String>,
        rewrite_assets: bool,
    ) -> Result<ProxyResponse, FetchError> {
        debug!("proxying request to: {}", target_url);

        let upstream =
            Self::build_upstream_request(target_url, &inbound, &custom_headers, rewrite_assets);
        let response = self.fetch.fetch(upstream).await?;

        let content_type = response.content_type();
        debug!(
            "response from {}: {} {}",
            target_url, response.status, content_type
        );

        // content-type gate for static assets, they're script-adjacent and an
        // upstream serving html here is either broken or hostile
        if target_url.contains("/_next/static/") {
            let ct = content_type.to_lowercase();
            if !VALID_STATIC_ASSET_TYPES
                .iter()
                .any(|allowed| ct.contains(allowed))
            {
                error!(
                    "invalid content-type {} for static asset {}",
                    content_type, target_url
                );
                return Ok(ProxyResponse::plain(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Invalid content-type for static asset",
                ));
            }
        }

        let mut headers = response.headers.clone();
        Self::apply_cors(&mut headers);
        for name in STRIPPED_RESPONSE_HEADERS {
            headers.remove(name);
        }

        if !rewrite_assets {
            // upstream failures degrade to a bare 404, their real status (and
            // body, often a challenge page) never reaches the client
            if !response.status.is_success() {
                warn!(
                    "asset fetch failed: {} - status: {}",
                    target_url, response.status
                );
                return Ok(ProxyResponse::plain(StatusCode::NOT_FOUND, "Not Found"));
            }

            if !ASSET_CONTENT_TYPE_RE.is_match(&content_type.to_lowercase()) {
                warn!("invalid content-type for asset: {}", content_type);
                return Ok(ProxyResponse::plain(StatusCode::NOT_FOUND, "Not Found"));
            }

            return Ok(ProxyResponse {
                status: response.status,
                headers,
                body: ProxyBody::Stream(response.body),
            });
        }

        if content_type.to_lowercase().contains("text/html") {
            let status = response.status;
            let content_encoding = response
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let raw = response.bytes().await?;
            let decompressed = Self::decompress(&raw, content_encoding.as_deref());
            let text = Self::decode_declared_charset(&decompressed, &content_type);

            let rewritten = match rewrite_services::origin_of(target_url) {
                Some(origin) => rewrite_services::rewrite_html(&text, &origin).0,
                None => {
                    // can't derive an origin to rewrite against, serve as-is
                    warn!("target url has no usable origin: {}", target_url);
                    text
                }
            };

            // the body was re-encoded, upstream framing headers are stale
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::CONTENT_ENCODING);
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );

            return Ok(ProxyResponse {
                status,
                headers,
                body: ProxyBody::Text(rewritten),
            });
        }

        // non-HTML document responses pass through untouched, no gate
        Ok(ProxyResponse {
            status: response.status,
            headers,
            body: ProxyBody::Stream(response.body),
        })
    }
}
