//! Request interception for the controlled page and its iframe tree.
//!
//! A single `InterceptService` instance owns the three mutable tables
//! (registered iframe origins, per-domain header overrides, navigation
//! attempts) and applies a fixed-priority policy pipeline to every request a
//! hosting runtime hands it: local proxy, passthrough, block, or a
//! direct fetch with injected headers. Blocks are always synthetic 200 HTML
//! pages - answering an iframe navigation with an error status trips browser
//! fallback behavior we don't want.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, error, warn};

use super::fetch_services::{DynFetchService, FetchRequest, FetchResponse};
use super::proxy_services::{ProxyBody, ProxyResponse};
use super::rewrite_services::origin_of;

pub const PROXY_MARKER: &str = "/worker-proxy";

// ad/tracking fragments, matched unanchored against the hostname. Imprecise
// on purpose - tightening this is a policy change, not a bug fix.
const BLOCKED_DOMAINS: [&str; 13] = [
    "adservice",
    "doubleclick",
    "googlesyndication",
    "google-analytics",
    "googleadservices",
    "analytics",
    "tracker",
    "popads",
    "popcash",
    "propellerads",
    "exoclick",
    "trafficjunky",
    "juicyads",
];

// URL fragments that smell like pop-up/ad chains
const POPUP_PATTERNS: [&str; 11] = [
    "click",
    "banner",
    "pop",
    "ad.",
    "ads.",
    "track",
    "promo",
    "window.open",
    ".php?",
    ".html?",
    "redirect",
];

// streaming CDNs that only work with injected headers and a CORS assist
const CORS_HELPER_HOSTNAMES: [&str; 8] = [
    "tmdb-embed-api.vercel.app",
    "cdn-centaurus.com",
    "premilkyway.com",
    "j5m9wakcpz.cdn-centaurus.com",
    "m3u8.streamifycdn.xyz",
    "uqloads.xyz",
    "embedsito.com",
    "swish.today",
];

// known-good metadata/embed hosts, never intercepted
const ALLOWED_EMBED_HOSTS: [&str; 22] = [
    "api.themoviedb.org",
    "image.tmdb.org",
    "vidlink.pro",
    "player.autoembed.cc",
    "www.2embed.cc",
    "multiembed.mov",
    "2embed.org",
    "autoembed.co",
    "vidsrc.xyz",
    "moviesapi.club",
    "www.nontongo.win",
    "111movies.com",
    "flicky.host",
    "vidjoy.pro",
    "embed.su",
    "www.primewire.tf",
    "embed.smashystream.com",
    "vidstream.site",
    "player.videasy.net",
    "vidsrc.wtf",
    "vidfast.pro",
    "vidbinge.dev",
];

const ALLOWED_EMBED_SUFFIXES: [&str; 3] = [
    ".firebaseio.com",
    ".firebaseapp.com",
    ".firebasestorage.googleapis.com",
];

const NAVIGATION_WINDOW: Duration = Duration::from_millis(1000);
const MAX_RAPID_NAVIGATIONS: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FetchMode {
    Navigate,
    Subresource,
}

/// where the request originated, when the hosting runtime can resolve it
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameType {
    TopLevel,
    Nested,
}

/// one request the runtime is about to perform on behalf of the page
pub struct InterceptedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub mode: FetchMode,
    pub referrer: Option<String>,
    pub client_id: Option<String>,
    pub frame_type: Option<FrameType>,
    pub body: Option<Bytes>,
    /// navigation-preload response already in flight, preferred when present
    pub preload: Option<FetchResponse>,
}

impl InterceptedRequest {
    pub fn subresource(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            mode: FetchMode::Subresource,
            referrer: None,
            client_id: None,
            frame_type: None,
            body: None,
            preload: None,
        }
    }

    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            mode: FetchMode::Navigate,
            ..Self::subresource(url)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InterceptDecision {
    /// request carries the proxy marker, handled by the local proxy
    LocalProxy,
    /// not intercepted, the platform performs the request natively
    Passthrough,
    /// answered with a synthetic block page carrying this reason
    Block(&'static str),
    /// allowed navigation, preload preferred then a plain fetch
    Navigate,
    /// CORS-helper fetch with stored header overrides
    DirectFetch,
}

/// control protocol. Anything that doesn't deserialize is ignored.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    #[serde(rename = "REGISTER_IFRAME_ORIGIN")]
    RegisterIframeOrigin { origin: String },
    #[serde(rename = "SET_PROXY_HEADERS")]
    SetProxyHeaders {
        domain: String,
        headers: HashMap<String, String>,
    },
    #[serde(rename = "CLEAR_DATA")]
    ClearData,
}

struct NavigationAttempt {
    time: Instant,
    count: u32,
    #[allow(dead_code)]
    url: String,
}

pub struct InterceptService {
    page_origin: String,
    fetch: DynFetchService,
    known_iframe_origins: Mutex<HashSet<String>>,
    proxy_headers: Mutex<HashMap<String, HashMap<String, String>>>,
    navigation_attempts: Mutex<HashMap<String, NavigationAttempt>>,
}

impl InterceptService {
    pub fn new(page_origin: impl Into<String>, fetch: DynFetchService) -> Self {
        Self {
            page_origin: page_origin.into(),
            fetch,
            known_iframe_origins: Mutex::new(HashSet::new()),
            proxy_headers: Mutex::new(HashMap::new()),
            navigation_attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle_message(&self, message: serde_json::Value) {
        let parsed: ControlMessage = match serde_json::from_value(message) {
            Ok(parsed) => parsed,
            Err(_) => {
                debug!("ignoring unrecognized control message");
                return;
            }
        };

        match parsed {
            ControlMessage::RegisterIframeOrigin { origin } => {
                debug!("registering iframe origin: {}", origin);
                self.known_iframe_origins
                    .lock()
                    .expect("iframe origins lock poisoned")
                    .insert(origin);
            }
            ControlMessage::SetProxyHeaders { domain, headers } => {
                debug!("setting proxy headers for domain: {}", domain);
                self.proxy_headers
                    .lock()
                    .expect("proxy headers lock poisoned")
                    .insert(domain, headers);
            }
            ControlMessage::ClearData => self.reset(),
        }
    }

    /// bulk clear of all three tables, tests and debugging depend on this
    pub fn reset(&self) {
        self.known_iframe_origins
            .lock()
            .expect("iframe origins lock poisoned")
            .clear();
        self.proxy_headers
            .lock()
            .expect("proxy headers lock poisoned")
            .clear();
        self.navigation_attempts
            .lock()
            .expect("navigation attempts lock poisoned")
            .clear();
        debug!("cleared all interception state");
    }

    /// stored override headers for a destination host. Entries are often bare
    /// registrable domains, so an exact hit is tried first and then a
    /// suffix/substring match.
    pub fn lookup_headers(&self, host: &str) -> Option<HashMap<String, String>> {
        let table = self
            .proxy_headers
            .lock()
            .expect("proxy headers lock poisoned");

        if let Some(headers) = table.get(host) {
            return Some(headers.clone());
        }

        table
            .iter()
            .find(|(domain, _)| host.contains(domain.as_str()))
            .map(|(_, headers)| headers.clone())
    }

    /// the policy pipeline, first match wins. Fixed order: the proxy marker
    /// and the allow/block lists have to run before the keyword heuristics,
    /// which are noisy by design and must never veto known-good embeds.
    pub fn decide(&self, request: &InterceptedRequest) -> InterceptDecision {
        let Ok(url) = url::Url::parse(&request.url) else {
            debug!("leaving unparseable url alone: {}", request.url);
            return InterceptDecision::Passthrough;
        };

        if url.path().contains(PROXY_MARKER) {
            return InterceptDecision::LocalProxy;
        }

        // same-origin subresource traffic is none of our business
        let origin = url.origin().ascii_serialization();
        if request.mode != FetchMode::Navigate && origin == self.page_origin {
            return InterceptDecision::Passthrough;
        }

        let host = url.host_str().unwrap_or("").to_lowercase();

        if BLOCKED_DOMAINS
            .iter()
            .any(|blocked| host.contains(blocked))
        {
            warn!("blocked request to ad/tracking domain: {}", host);
            return InterceptDecision::Block("Ad or tracking domain blocked");
        }

        if is_allowed_embed_host(&host) {
            return InterceptDecision::Passthrough;
        }

        if url.path().starts_with("/api/") {
            return InterceptDecision::Passthrough;
        }

        if request.mode == FetchMode::Navigate {
            if matches!(request.frame_type, Some(FrameType::Nested)) {
                warn!(
                    "blocked navigation from non-top-level frame: {}",
                    request.url
                );
                return InterceptDecision::Block("Blocked navigation from iframe or popup");
            }

            if let Some(client_id) = &request.client_id {
                if self.note_navigation(client_id, &request.url, Instant::now()) {
                    warn!("blocked rapid navigation chain: {}", request.url);
                    return InterceptDecision::Block("Too many navigation attempts");
                }
            }

            return InterceptDecision::Navigate;
        }

        if self.is_probably_popup(request) {
            warn!("blocked potential pop-up: {}", request.url);
            return InterceptDecision::Block("Pop-up blocked");
        }

        if CORS_HELPER_HOSTNAMES
            .iter()
            .any(|helped| host.contains(helped))
        {
            debug!("proxying streaming content: {}", host);
            return InterceptDecision::DirectFetch;
        }

        InterceptDecision::Passthrough
    }

    /// sliding window accounting: every attempt overwrites the record, and the
    /// check plus the update happen under one lock acquisition so concurrent
    /// handlers can't split the read-modify-write. Returns true when this
    /// attempt crossed the limit.
    pub fn note_navigation(&self, client_id: &str, url: &str, now: Instant) -> bool {
        let mut attempts = self
            .navigation_attempts
            .lock()
            .expect("navigation attempts lock poisoned");

        let prior = attempts
            .get(client_id)
            .map(|last| (last.time, last.count));

        let count = match prior {
            Some((time, count)) if now.duration_since(time) < NAVIGATION_WINDOW => count + 1,
            _ => 1,
        };

        attempts.insert(
            client_id.to_string(),
            NavigationAttempt {
                time: now,
                count,
                url: url.to_string(),
            },
        );

        count > MAX_RAPID_NAVIGATIONS
    }

    fn is_probably_popup(&self, request: &InterceptedRequest) -> bool {
        if let Some(referrer) = &request.referrer {
            if let Some(referrer_origin) = origin_of(referrer) {
                let registered = self
                    .known_iframe_origins
                    .lock()
                    .expect("iframe origins lock poisoned")
                    .contains(&referrer_origin);
                if registered {
                    // anything navigating out of a registered iframe origin
                    // is treated as a pop-up attempt
                    return true;
                }
            }
        }

        let lower = request.url.to_lowercase();
        if POPUP_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
            return true;
        }

        lower.contains("target=_blank") || lower.contains("window.open")
    }

    /// run the pipeline and execute the decision. `None` means not
    /// intercepted - the caller lets the platform perform the request
    /// natively. Every intercepted path converts its own failures into a
    /// response, nothing escapes as an error.
    pub async fn handle_fetch(&self, request: InterceptedRequest) -> Option<ProxyResponse> {
        match self.decide(&request) {
            InterceptDecision::Passthrough => None,
            InterceptDecision::Block(reason) => Some(block_response(reason)),
            InterceptDecision::LocalProxy => Some(self.local_proxy(request).await),
            InterceptDecision::Navigate => Some(self.navigate_fetch(request).await),
            InterceptDecision::DirectFetch => Some(self.direct_fetch(request).await),
        }
    }

    /// the proxy-marker path: fetch the `url` query parameter on the page's
    /// behalf, masquerading as the target's own origin. Cookies are never
    /// forwarded in either direction.
    async fn local_proxy(&self, request: InterceptedRequest) -> ProxyResponse {
        let Ok(parsed) = url::Url::parse(&request.url) else {
            return ProxyResponse::plain(StatusCode::BAD_REQUEST, "Missing URL parameter");
        };

        let target = parsed
            .query_pairs()
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.to_string());

        let Some(target) = target else {
            return ProxyResponse::plain(StatusCode::BAD_REQUEST, "Missing URL parameter");
        };

        debug!("proxying request to: {}", target);

        let headers_param = parsed
            .query_pairs()
            .find(|(key, _)| key == "headers")
            .map(|(_, value)| value.to_string());

        let target_host = url::Url::parse(&target)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()));

        let custom_headers: HashMap<String, String> = match headers_param {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("failed to parse headers param: {}", e);
                    HashMap::new()
                }
            },
            None => target_host
                .as_deref()
                .and_then(|host| self.lookup_headers(host))
                .unwrap_or_default(),
        };

        let mut outbound = FetchRequest::new(request.method.clone(), target.clone());
        outbound.headers = request.headers.clone();
        overlay_headers(&mut outbound.headers, &custom_headers);

        // the target sees itself as the initiator
        if let Some(target_origin) = origin_of(&target) {
            if let Ok(value) = HeaderValue::from_str(&target_origin) {
                outbound.headers.insert(header::ORIGIN, value.clone());
                outbound.headers.insert(header::REFERER, value);
            }
        }

        outbound.body = request.body.clone();

        match self.fetch.fetch(outbound).await {
            Ok(mut response) => {
                debug!("proxy successful: {}", response.status);
                response.headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
                ProxyResponse {
                    status: response.status,
                    headers: response.headers,
                    body: ProxyBody::Stream(response.body),
                }
            }
            Err(e) => {
                error!("proxy fetch error: {}", e);
                ProxyResponse::plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Proxy error: {}", e),
                )
            }
        }
    }

    /// CORS-helper hosts: original headers plus stored overrides, and the
    /// response gets a wildcard allow-origin. A failed helped fetch falls
    /// back to the request exactly as the page issued it.
    async fn direct_fetch(&self, request: InterceptedRequest) -> ProxyResponse {
        let host = url::Url::parse(&request.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default();

        let overrides = self.lookup_headers(&host).unwrap_or_default();

        let mut outbound = FetchRequest::new(request.method.clone(), request.url.clone());
        outbound.headers = request.headers.clone();
        overlay_headers(&mut outbound.headers, &overrides);
        outbound.body = request.body.clone();

        match self.fetch.fetch(outbound).await {
            Ok(mut response) => {
                response.headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
                ProxyResponse {
                    status: response.status,
                    headers: response.headers,
                    body: ProxyBody::Stream(response.body),
                }
            }
            Err(e) => {
                error!("helped fetch failed, retrying plain: {}", e);

                let mut plain = FetchRequest::new(request.method.clone(), request.url.clone());
                plain.headers = request.headers.clone();
                plain.body = request.body;

                match self.fetch.fetch(plain).await {
                    Ok(response) => ProxyResponse {
                        status: response.status,
                        headers: response.headers,
                        body: ProxyBody::Stream(response.body),
                    },
                    Err(e) => {
                        error!("fallback fetch failed too: {}", e);
                        ProxyResponse::plain(
                            StatusCode::BAD_GATEWAY,
                            format!("Proxy error: {}", e),
                        )
                    }
                }
            }
        }
    }

    /// allowed navigation: a preload response already in flight wins,
    /// otherwise fetch as normal
    async fn navigate_fetch(&self, request: InterceptedRequest) -> ProxyResponse {
        let mut request = request;

        if let Some(preload) = request.preload.take() {
            return ProxyResponse {
                status: preload.status,
                headers: preload.headers,
                body: ProxyBody::Stream(preload.body),
            };
        }

        let mut outbound = FetchRequest::new(request.method.clone(), request.url.clone());
        outbound.headers = request.headers.clone();
        outbound.body = request.body;

        match self.fetch.fetch(outbound).await {
            Ok(response) => ProxyResponse {
                status: response.status,
                headers: response.headers,
                body: ProxyBody::Stream(response.body),
            },
            Err(e) => {
                error!("navigation fetch failed: {}", e);
                ProxyResponse::plain(StatusCode::BAD_GATEWAY, format!("Proxy error: {}", e))
            }
        }
    }
}

fn is_allowed_embed_host(host: &str) -> bool {
    ALLOWED_EMBED_HOSTS.contains(&host)
        || ALLOWED_EMBED_SUFFIXES
            .iter()
            .any(|suffix| host.ends_with(suffix))
}

fn overlay_headers(headers: &mut HeaderMap, overrides: &HashMap<String, String>) {
    for (key, value) in overrides {
        match (
            HeaderName::try_from(key.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("skipping unusable override header: {}", key),
        }
    }
}

/// synthetic block page, served 200 on purpose
pub fn block_response(reason: &str) -> ProxyResponse {
    ProxyResponse::html(
        StatusCode::OK,
        format!(
            "<html><body style=\"background:#111;color:#fff;font-family:sans-serif;padding:20px;\">\
             <h2>Request Blocked</h2>\
             <p>{}</p>\
             </body></html>",
            reason
        ),
    )
}

/// route an arbitrary target through the edge proxy
pub fn proxy_url(target: &str) -> String {
    format!("{}?url={}", PROXY_MARKER, urlencoding::encode(target))
}
