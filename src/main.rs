use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "ssr")] {
        use anyhow::Context;
        use dotenv::dotenv;
        use productive_me::app::app_router;
        use productive_me::config::AppConfig;
        use productive_me::middleware::tracing::ColoredFields;
        use productive_me::state::AppState;
        use tracing_subscriber::EnvFilter;

        #[tokio::main]
        async fn main() -> anyhow::Result<()> {
            dotenv().ok();

            tracing_subscriber::fmt()
                .fmt_fields(ColoredFields)
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .init();

            let config = AppConfig::from_env().context("failed to load configuration")?;
            let addr = config.site_addr;

            let app = app_router(AppState::from_config(config));

            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            log::info!("listening on http://{}", &addr);
            axum::serve(listener, app).await.context("server error")?;
            Ok(())
        }
    } else {
        pub fn main() {
            // the server needs the `ssr` feature; without it only the
            // protocol core is built
        }
    }
}
