use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::Response;
use tower::ServiceExt;

use embed_edge::AppConfig;
use embed_edge::server::EdgeApplicationServer;
use embed_edge::server::services::edge_services::EdgeServices;
use embed_edge::server::services::fetch_services::{
    DynFetchService, FetchError, FetchResponse, MockFetchServiceTrait,
};
use embed_edge::server::services::intercept_services::InterceptService;
use embed_edge::server::services::proxy_services::{FORCED_USER_AGENT, ProxyService};

fn test_app(mock: MockFetchServiceTrait) -> Router {
    let fetch: DynFetchService = Arc::new(mock);
    let config = Arc::new(AppConfig::default());

    let services = EdgeServices {
        fetch: fetch.clone(),
        proxy: Arc::new(ProxyService::new(fetch.clone())),
        intercept: Arc::new(InterceptService::new(
            config.page_origin.clone(),
            fetch.clone(),
        )),
        config,
    };

    EdgeApplicationServer::app(services)
}

fn upstream(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> FetchResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type).expect("content type should parse"),
    );
    let body: Vec<u8> = body.into();
    FetchResponse::from_bytes(status, headers, body)
}

async fn send(app: Router, method: &str, uri: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build"),
    )
    .await
    .expect("router should respond")
}

async fn read_body(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn test_options_preflight_answers_on_any_path() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "OPTIONS", "/anything/at/all").await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .expect("methods header"),
        "GET, HEAD, POST, OPTIONS"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_MAX_AGE)
            .expect("max-age header"),
        "86400"
    );
}

#[tokio::test]
async fn test_options_preflight_answers_on_proxy_routes_too() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "OPTIONS", "/worker-proxy").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_missing_url_parameter_is_a_400() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/worker-proxy").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );
    assert_eq!(read_body(response).await, "Missing url parameter");
}

#[tokio::test]
async fn test_malformed_headers_param_is_a_400() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(
        app,
        "GET",
        "/worker-proxy?url=https://example.com/page.html&headers=notjson",
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_body(response).await, "Invalid headers param");
}

#[tokio::test]
async fn test_document_mode_rewrites_asset_urls_and_strips_framing_headers() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .withf(|request| {
            request.url == "https://example.com/page.html"
                && request.headers.get(header::USER_AGENT).map(|v| v.as_bytes())
                    == Some(FORCED_USER_AGENT.as_bytes())
                && request.headers.get(header::ACCEPT).map(|v| v.as_bytes())
                    == Some(b"*/*".as_slice())
        })
        .times(1)
        .returning(|_| {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            headers.insert(
                "content-security-policy",
                HeaderValue::from_static("default-src 'none'"),
            );
            headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
            Ok(FetchResponse::from_bytes(
                StatusCode::OK,
                headers,
                r#"<html><script src="/static/app.js"></script></html>"#.as_bytes().to_vec(),
            ))
        });

    let app = test_app(mock);
    let response = send(app, "GET", "/worker-proxy?url=https://example.com/page.html").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-security-policy").is_none());
    assert!(response.headers().get("x-frame-options").is_none());
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("content type"),
        "text/html; charset=utf-8"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );

    let body = read_body(response).await;
    assert!(body.contains(r#"src="/worker-proxy/static/app.js?origin=https://example.com""#));
}

#[tokio::test]
async fn test_document_mode_decodes_the_declared_charset() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch().times(1).returning(|_| {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=iso-8859-1"),
        );
        // 0xE9 is é in latin-1 and invalid utf-8
        let mut body = b"<p>caf".to_vec();
        body.push(0xE9);
        body.extend_from_slice(b"</p><img src=\"/static/p.png\">");
        Ok(FetchResponse::from_bytes(StatusCode::OK, headers, body))
    });

    let app = test_app(mock);
    let response = send(app, "GET", "/worker-proxy?url=https://example.com/x").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("content type"),
        "text/html; charset=utf-8"
    );

    let body = read_body(response).await;
    assert!(body.contains("café"));
    assert!(body.contains("/worker-proxy/static/p.png?origin=https://example.com"));
}

#[tokio::test]
async fn test_only_allowlisted_request_headers_are_forwarded() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .withf(|request| {
            request
                .headers
                .get(header::ACCEPT_LANGUAGE)
                .map(|v| v.as_bytes())
                == Some(b"en-US".as_slice())
                && request.headers.get(header::COOKIE).is_none()
                && request.headers.get("x-api-key").is_none()
        })
        .times(1)
        .returning(|_| {
            Ok(upstream(
                StatusCode::OK,
                "text/html",
                "<html></html>".as_bytes().to_vec(),
            ))
        });

    let app = test_app(mock);
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/worker-proxy?url=https://example.com/x")
                .header(header::ACCEPT_LANGUAGE, "en-US")
                .header(header::COOKIE, "session=secret")
                .header("x-api-key", "secret")
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("router should respond");

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_caller_supplied_headers_overlay_the_upstream_request() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .withf(|request| {
            request.headers.get("x-custom").map(|v| v.as_bytes()) == Some(b"1".as_slice())
        })
        .times(1)
        .returning(|_| {
            Ok(upstream(
                StatusCode::OK,
                "text/html",
                "<html></html>".as_bytes().to_vec(),
            ))
        });

    let app = test_app(mock);
    // headers={"x-custom":"1"} percent-encoded
    let response = send(
        app,
        "GET",
        "/worker-proxy?url=https://example.com/x&headers=%7B%22x-custom%22%3A%221%22%7D",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_asset_route_reassembles_the_target_and_streams_it() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .withf(|request| request.url == "https://example.com/_next/static/chunks/app.js")
        .times(1)
        .returning(|_| {
            Ok(upstream(
                StatusCode::OK,
                "application/javascript",
                "console.log(1)".as_bytes().to_vec(),
            ))
        });

    let app = test_app(mock);
    let response = send(
        app,
        "GET",
        "/worker-proxy/_next/static/chunks/app.js?origin=https://example.com",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .expect("content type"),
        "application/javascript"
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );
    assert_eq!(read_body(response).await, "console.log(1)");
}

#[tokio::test]
async fn test_asset_route_requires_the_origin_parameter() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/worker-proxy/_next/static/chunks/app.js").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_body(response).await, "Missing origin parameter for asset");
}

#[tokio::test]
async fn test_static_assets_with_a_wrong_content_type_are_a_415() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch().times(1).returning(|_| {
        Ok(upstream(
            StatusCode::OK,
            "text/html",
            "<html>definitely not a script</html>".as_bytes().to_vec(),
        ))
    });

    let app = test_app(mock);
    let response = send(
        app,
        "GET",
        "/worker-proxy/_next/static/chunks/app.js?origin=https://example.com",
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(read_body(response).await, "Invalid content-type for static asset");
}

#[tokio::test]
async fn test_other_assets_with_a_disallowed_content_type_degrade_to_404() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch().times(1).returning(|_| {
        Ok(upstream(
            StatusCode::OK,
            "text/html",
            "upstream html the client must never see".as_bytes().to_vec(),
        ))
    });

    let app = test_app(mock);
    let response = send(
        app,
        "GET",
        "/worker-proxy/media/logo.bin?origin=https://example.com",
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_body(response).await, "Not Found");
}

#[tokio::test]
async fn test_failed_asset_upstreams_never_leak_their_status_or_body() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch().times(1).returning(|_| {
        Ok(upstream(
            StatusCode::INTERNAL_SERVER_ERROR,
            "image/png",
            "secret upstream error page".as_bytes().to_vec(),
        ))
    });

    let app = test_app(mock);
    let response = send(
        app,
        "GET",
        "/worker-proxy/media/poster.png?origin=https://example.com",
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_body(response).await, "Not Found");
}

#[tokio::test]
async fn test_direct_static_hits_fall_back_to_the_default_origin() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .withf(|request| request.url == "https://vidlink.pro/_next/static/chunks/foo.js")
        .times(1)
        .returning(|_| {
            Ok(upstream(
                StatusCode::OK,
                "text/javascript",
                "export {}".as_bytes().to_vec(),
            ))
        });

    let app = test_app(mock);
    let response = send(app, "GET", "/_next/static/chunks/foo.js").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, "export {}");
}

#[tokio::test]
async fn test_document_fetch_failures_are_a_502_with_the_error_text() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .times(1)
        .returning(|_| Err(FetchError("connection refused".to_string())));

    let app = test_app(mock);
    let response = send(app, "GET", "/worker-proxy?url=https://gone.example/x").await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );
    let body = read_body(response).await;
    assert!(body.starts_with("Proxy error:"));
    assert!(body.contains("connection refused"));
}

#[tokio::test]
async fn test_asset_fetch_failures_are_a_502_with_their_own_message() {
    let mut mock = MockFetchServiceTrait::new();
    mock.expect_fetch()
        .times(1)
        .returning(|_| Err(FetchError("tls handshake failed".to_string())));

    let app = test_app(mock);
    let response = send(
        app,
        "GET",
        "/worker-proxy/static/app.js?origin=https://gone.example",
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = read_body(response).await;
    assert!(body.starts_with("Proxy asset error:"));
}

#[tokio::test]
async fn test_unhandled_paths_are_a_404_with_cors() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/nothing/here").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .expect("origin header"),
        "*"
    );
    assert_eq!(read_body(response).await, "Not Found");
}

#[tokio::test]
async fn test_message_endpoint_answers() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/message").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, "Hello, World!");
}

#[tokio::test]
async fn test_random_endpoint_returns_a_v4_uuid() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/random").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_body(response).await;
    assert_eq!(body.len(), 36);
    assert_eq!(body.matches('-').count(), 4);
}

#[tokio::test]
async fn test_health_endpoint_reports_healthy() {
    let app = test_app(MockFetchServiceTrait::new());
    let response = send(app, "GET", "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_body(response).await;
    assert!(body.contains(r#""status":"healthy""#));
    assert!(body.contains(r#""version""#));
}
