mod config;
mod db;
mod frame;
mod routes;
mod services;
mod shape;
mod state;

use std::sync::Arc;

use services::auth::PgAuth;
use services::persistence::PgBoardRepository;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env().expect("invalid configuration");

    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("database init failed");

    let auth = Arc::new(PgAuth::new(pool.clone()));
    let state = state::AppState::new(Arc::new(PgBoardRepository::new(pool)), auth.clone(), auth)
        .with_realtime(config.realtime)
        .with_board_defaults(config.board_defaults);

    // Spawn background persistence task.
    let _persistence = services::persistence::spawn_persistence_task(state.clone(), config.flush_interval);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "liveboard listening");
    axum::serve(listener, app).await.expect("server failed");
}
