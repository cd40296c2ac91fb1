#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to, 8787 to stay drop-in compatible with the
    // worker dev server the front end already points at
    #[clap(long, env, default_value = "8787")]
    pub port: u16,

    // origin of the page whose traffic the interception layer polices. The
    // same-origin passthrough rule (and nothing else) depends on this.
    #[clap(long, env, default_value = "http://localhost:3000")]
    pub page_origin: String,

    // upstream origin used when a /_next/static asset request reaches us
    // directly instead of through a rewritten /worker-proxy URL
    #[clap(long, env, default_value = "https://vidlink.pro")]
    pub default_asset_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 8787,
            page_origin: "http://localhost:3000".to_string(),
            default_asset_origin: "https://vidlink.pro".to_string(),
            sentry_dsn: None,
        }
    }
}
