use std::sync::Arc;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};

use lingua_gateway::config::Config;
use lingua_gateway::state::AppState;

fn build_app(state: AppState) -> axum::Router {
    // Rate limiting: 60 req burst, replenish 1 per second, per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(60)
        .finish()
        .expect("rate limiter config");

    lingua_gateway::create_router(state).layer(GovernorLayer {
        config: Arc::new(governor_conf),
    })
}

/// Map the LOG_LEVEL option onto a tracing directive. RUST_LOG, when set,
/// wins over this.
fn log_directive(level: &str) -> String {
    match level {
        "none" => "off".to_string(),
        "error" | "warn" | "info" | "debug" => level.to_string(),
        other => {
            eprintln!("unrecognized LOG_LEVEL {other:?}, falling back to info");
            "info".to_string()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();
    let config = Config::from_env();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(&config.log_level)));
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(true)
            .init();
    }

    let port = config.port;
    let state = AppState::new(config);
    let app = build_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    print_banner(port);
    tracing::info!("lingua-gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn print_banner(port: u16) {
    println!();
    println!("  \x1b[1;36m>>>  LINGUA GATEWAY  <<<\x1b[0m");
    println!("  \x1b[36mGemini translation front door\x1b[0m");
    println!("  \x1b[1;32mhttp://localhost:{port}\x1b[0m");
    println!();
}

/// Resolves once the process is asked to stop: ctrl-c everywhere, plus
/// SIGTERM on unix so container orchestrators get a clean drain.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("shutdown: cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown: ctrl-c received, draining"),
        () = terminate => tracing::info!("shutdown: SIGTERM received, draining"),
    }
}
