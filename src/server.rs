use std::sync::Arc;

use axum::{routing::post, Router};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::dispatch::DedupCache;
use crate::error::Result;
use crate::scm::github::GitHubClient;
use crate::state::{AttemptStore, StateStore};

/// Shared state for the webhook server. The server only verifies,
/// routes, and dispatches; phase work happens in spawned processes.
pub struct AppState {
    pub config: AppConfig,
    pub config_path: Option<String>,
    pub store: StateStore,
    pub attempts: AttemptStore,
    pub github: GitHubClient,
    pub dedup: DedupCache,
}

impl AppState {
    pub fn new(config: AppConfig, config_path: Option<String>) -> Result<Self> {
        let store = StateStore::new(config.storage.data_dir.clone());
        let attempts = AttemptStore::new(store.attempts_path());
        let github = GitHubClient::new(&config.github)?;

        Ok(Self {
            config,
            config_path,
            store,
            attempts,
            github,
            dedup: DedupCache::default(),
        })
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/github", post(crate::webhook::handler::handle_webhook))
        .route("/health", axum::routing::get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
