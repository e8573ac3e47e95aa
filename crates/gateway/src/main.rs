use cdc_gateway::{config, http};

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

    let backends = match http::Backends::open(&config).await {
        Ok(backends) => backends,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let app = match http::router(config.clone(), &backends) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    tracing::info!(bind_addr = %config.bind_addr, "cdc-gateway listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("cdc-gateway shutting down");
        })
        .await;

    backends.close().await;

    if let Err(err) = served {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}
