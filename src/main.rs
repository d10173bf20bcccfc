use std::{io, net::SocketAddr, sync::atomic, time::Duration};

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use axum_server::{bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use http::{
    header::{self, HeaderName},
    Method, StatusCode, Uri,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
    ServiceBuilderExt as _,
};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};
use vigil::api::{dms, recovery};

pub use vigil::*; // Re-export everything from the library crate

#[tokio::main]
async fn main() {
    clap::parse();

    // Initialize config
    let raw_config = Figment::new()
        .merge(Toml::file(Env::var_or("VIGIL_CONFIG", "vigil.toml")))
        .merge(Env::prefixed("VIGIL_").global());

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    config.warn_deprecated();

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").unwrap()
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    info!("{}", config);

    info!("Loading database");
    if let Err(error) = KeyValueDatabase::load_or_create(config).await {
        tracing::error!(?error, "The database couldn't be loaded or created");

        std::process::exit(1);
    };

    info!("Starting server");
    run_server().await.unwrap();
}

async fn run_server() -> io::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let x_cron_secret = HeaderName::from_static("x-cron-secret");

    let middlewares = ServiceBuilder::new()
        .sensitive_headers([x_cron_secret.clone()])
        .layer(axum::middleware::from_fn(spawn_task))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
                let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                tracing::info_span!("http_request", %path)
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::ORIGIN,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    x_cron_secret,
                ])
                .max_age(Duration::from_secs(86400)),
        );

    let app = routes().layer(middlewares).into_make_service();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    match &config.tls {
        Some(tls) => {
            let conf = RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?;
            bind_rustls(addr, conf).handle(handle).serve(app).await?;
        }
        None => {
            bind(addr).handle(handle).serve(app).await?;
        }
    }

    Ok(())
}

async fn spawn_task(req: Request, next: Next) -> std::result::Result<Response, StatusCode> {
    if services().globals.shutdown.load(atomic::Ordering::Relaxed) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    tokio::spawn(next.run(req))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn routes() -> Router {
    Router::new()
        .route("/api/recovery/distribute", post(recovery::distribute_route))
        .route(
            "/api/recovery/guardians/{pubkey}",
            get(recovery::guardians_route),
        )
        .route(
            "/api/recovery/guardianships/{pubkey}",
            get(recovery::guardianships_route),
        )
        .route("/api/recovery/request", post(recovery::create_session_route))
        .route(
            "/api/recovery/session/{session_id}/status",
            get(recovery::session_status_route),
        )
        .route(
            "/api/recovery/session/{session_id}/approve",
            post(recovery::approve_route),
        )
        .route(
            "/api/recovery/session/{session_id}/shares",
            get(recovery::session_shares_route),
        )
        .route("/api/recovery/revoke", delete(recovery::revoke_route))
        .route("/api/dms/create", post(dms::create_route))
        .route("/api/dms/checkin", post(dms::checkin_route))
        .route("/api/dms/list/{pubkey}", get(dms::list_route))
        .route("/api/dms/process", post(dms::process_route))
        .route("/api/dms/{switch_id}", delete(dms::cancel_route))
        .route("/", get(it_works))
        .fallback(not_found)
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    services().globals.shutdown();
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    Error::BadRequest(ErrorKind::NotFound, "Unrecognized request")
}

async fn it_works() -> &'static str {
    "Hello from vigil!"
}
