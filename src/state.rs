use axum::extract::FromRef;
use log::{info, warn};
use std::sync::Arc;

use crate::actions::{ActionExecutor, MemoryActionExecutor, PostgrestActionExecutor};
use crate::cancellable_stream::StreamRegistry;
use crate::config::AppConfig;
use crate::context::{ContextSource, MemoryContextSource, PostgrestContextSource};
use crate::supabase::build_client;

#[derive(FromRef, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub streams: StreamRegistry,
    pub context_source: Arc<dyn ContextSource>,
    pub actions: Arc<dyn ActionExecutor>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        context_source: Arc<dyn ContextSource>,
        actions: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            streams: StreamRegistry::new(),
            context_source,
            actions,
        }
    }

    /// Wires Supabase-backed collaborators when configured, in-memory ones
    /// otherwise.
    pub fn from_config(config: AppConfig) -> Self {
        match &config.supabase {
            Some(supabase) => {
                info!("Using Supabase at {}", supabase.url);
                let client = build_client(supabase);
                let context_source = Arc::new(PostgrestContextSource::new(client.clone()));
                let actions = Arc::new(PostgrestActionExecutor::new(client));
                Self::new(config, context_source, actions)
            }
            None => {
                warn!("SUPABASE_URL/SUPABASE_KEY not set, using in-memory stores");
                Self::new(
                    config,
                    Arc::new(MemoryContextSource::new()),
                    Arc::new(MemoryActionExecutor::new()),
                )
            }
        }
    }
}
