use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;

use super::fetch_services::{DynFetchService, ReqwestFetchService};
use super::intercept_services::InterceptService;
use super::proxy_services::{DynProxyService, ProxyService};

/// edge services without any backing stores
/// everything here is in-memory and process-lifetime
#[derive(Clone)]
pub struct EdgeServices {
    pub fetch: DynFetchService,
    pub proxy: DynProxyService,
    pub intercept: Arc<InterceptService>,
    pub config: Arc<AppConfig>,
}

impl EdgeServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        info!("starting edge services (no database)...");

        // redirects are followed upstream, clients only ever see the final
        // response
        let http = reqwest::Client::new();
        let fetch = Arc::new(ReqwestFetchService::new(http)) as DynFetchService;

        let proxy = Arc::new(ProxyService::new(fetch.clone())) as DynProxyService;

        let intercept = Arc::new(InterceptService::new(
            config.page_origin.clone(),
            fetch.clone(),
        ));

        Self {
            fetch,
            proxy,
            intercept,
            config,
        }
    }
}
