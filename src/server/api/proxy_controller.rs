// request classification for the edge proxy. The routes are the wire contract
// the front end and the rewritten documents both depend on, don't move them.
use std::collections::HashMap;

use axum::{
    Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::any,
};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::server::{
    error::{AppResult, Error},
    services::{
        edge_services::EdgeServices,
        proxy_services::{InboundRequest, ProxyBody, ProxyResponse},
    },
};

#[derive(Deserialize)]
struct DocumentQuery {
    url: Option<String>,
    headers: Option<String>,
}

#[derive(Deserialize)]
struct AssetQuery {
    origin: Option<String>,
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route("/message", any(Self::message_endpoint))
            .route("/random", any(Self::random_endpoint))
            .route("/worker-proxy", any(Self::proxy_document))
            .route("/worker-proxy/{*asset}", any(Self::proxy_asset))
            .route("/_next/static/{*asset}", any(Self::asset_fallback))
            .fallback(Self::not_found)
    }

    // preflight answer for OPTIONS on any path, routes that aren't built from
    // this controller mount it themselves
    pub async fn preflight_endpoint() -> Response {
        Self::preflight()
    }

    fn preflight() -> Response {
        let mut headers = HeaderMap::new();
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
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        );

        ProxyResponse {
            status: StatusCode::NO_CONTENT,
            headers,
            body: ProxyBody::Empty,
        }
        .into_response()
    }

    async fn message_endpoint(method: Method) -> Response {
        if method == Method::OPTIONS {
            return Self::preflight();
        }

        ProxyResponse::plain(StatusCode::OK, "Hello, World!").into_response()
    }

    async fn random_endpoint(method: Method) -> Response {
        if method == Method::OPTIONS {
            return Self::preflight();
        }

        ProxyResponse::plain(StatusCode::OK, uuid::Uuid::new_v4().to_string()).into_response()
    }

    /// main document proxy: fetches the target with rewriting enabled so the
    /// served page references its assets through /worker-proxy
    async fn proxy_document(
        method: Method,
        Query(params): Query<DocumentQuery>,
        headers: HeaderMap,
        Extension(services): Extension<EdgeServices>,
    ) -> AppResult<Response> {
        if method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        let Some(target_url) = params.url else {
            return Err(Error::BadRequest("Missing url parameter".to_string()));
        };

        debug!("handling /worker-proxy for: {}", target_url);

        let custom_headers: HashMap<String, String> = match params.headers.as_deref() {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|_| Error::BadRequest("Invalid headers param".to_string()))?,
            None => HashMap::new(),
        };

        let inbound = InboundRequest { method, headers };

        match services
            .proxy
            .proxy_fetch(&target_url, inbound, custom_headers, true)
            .await
        {
            Ok(response) => Ok(response.into_response()),
            Err(e) => {
                error!("proxy fetch error: {}", e);
                Err(Error::BadGateway(format!("Proxy error: {}", e)))
            }
        }
    }

    /// subresource proxy: the rewritten documents point here, the original
    /// target is reassembled from the path plus the origin query param
    async fn proxy_asset(
        method: Method,
        Path(asset): Path<String>,
        Query(params): Query<AssetQuery>,
        headers: HeaderMap,
        Extension(services): Extension<EdgeServices>,
    ) -> AppResult<Response> {
        if method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        let Some(origin) = params.origin else {
            return Err(Error::BadRequest(
                "Missing origin parameter for asset".to_string(),
            ));
        };

        debug!("handling asset proxy for: /{} (origin: {})", asset, origin);

        let asset_url = format!("{}/{}", origin, asset);
        let inbound = InboundRequest { method, headers };

        match services
            .proxy
            .proxy_fetch(&asset_url, inbound, HashMap::new(), false)
            .await
        {
            Ok(response) => Ok(response.into_response()),
            Err(e) => {
                error!("proxy asset error: {}", e);
                Err(Error::BadGateway(format!("Proxy asset error: {}", e)))
            }
        }
    }

    /// catches asset requests that bypassed URL rewriting and lands them on
    /// the configured default upstream
    async fn asset_fallback(
        method: Method,
        Path(asset): Path<String>,
        headers: HeaderMap,
        Extension(services): Extension<EdgeServices>,
    ) -> AppResult<Response> {
        if method == Method::OPTIONS {
            return Ok(Self::preflight());
        }

        let asset_url = format!(
            "{}/_next/static/{}",
            services.config.default_asset_origin, asset
        );
        warn!(
            "fallback: rewriting direct asset request /_next/static/{} to {}",
            asset, asset_url
        );

        let inbound = InboundRequest { method, headers };

        match services
            .proxy
            .proxy_fetch(&asset_url, inbound, HashMap::new(), false)
            .await
        {
            Ok(response) => Ok(response.into_response()),
            Err(e) => {
                error!("proxy asset error: {}", e);
                Err(Error::BadGateway(format!("Proxy asset error: {}", e)))
            }
        }
    }

    async fn not_found(method: Method, uri: Uri) -> Response {
        if method == Method::OPTIONS {
            return Self::preflight();
        }

        warn!("not rewritten or not handled: {}", uri);
        Error::NotFound.into_response()
    }
}
