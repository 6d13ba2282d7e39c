use std::net::SocketAddr;

use axum::{routing, Router};
use dispatch::app::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dispatch=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_state = AppState::new_from_env().await.unwrap();
    app_state.run_migration().await.unwrap();

    let api = Router::new()
        .route("/status", routing::get(dispatch::api::v1::status::status))
        .nest(
            "/auth",
            Router::new()
                .route("/register", routing::post(dispatch::api::v1::auth::register))
                .route("/login", routing::post(dispatch::api::v1::auth::login))
                .route("/me", routing::get(dispatch::api::v1::auth::me)),
        )
        .nest(
            "/couriers",
            Router::new()
                .route("/", routing::get(dispatch::api::v1::courier::index))
                .route("/", routing::post(dispatch::api::v1::courier::create))
                .route("/:id", routing::get(dispatch::api::v1::courier::show))
                .route("/:id", routing::put(dispatch::api::v1::courier::update))
                .route("/:id", routing::delete(dispatch::api::v1::courier::delete)),
        )
        .nest(
            "/orders",
            Router::new()
                .route("/", routing::get(dispatch::api::v1::order::index))
                .route("/", routing::post(dispatch::api::v1::order::create))
                .route("/stats", routing::get(dispatch::api::v1::order::stats))
                .route("/:id", routing::get(dispatch::api::v1::order::show))
                .route("/:id", routing::put(dispatch::api::v1::order::update))
                .route("/:id/assign", routing::post(dispatch::api::v1::order::assign))
                .route(
                    "/:id/status",
                    routing::post(dispatch::api::v1::order::change_status),
                ),
        );

    let app = Router::new()
        .nest("/api", api)
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let port = std::env::var("PORT")
        .ok()
        .and_then(|it| it.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::debug!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
