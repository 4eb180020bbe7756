use robokache_gateway::{config, http};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let app = match http::router(config.clone()).await {
        Ok(app) => app,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!(
                "STARTUP_ERROR ERR_BIND_FAILED failed to bind {}: {}",
                config.bind_addr, err
            );
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        db = %config.db_location(),
        max_blob_bytes = config.max_blob_bytes,
        keys_url = %config.verifier.keys_url,
        keys_cache_ttl_secs = config.verifier.keys_cache_ttl.as_secs(),
        "robokache-gateway listening"
    );

    let served = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("robokache-gateway shutting down");
    });
    if let Err(err) = served.await {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}
