//! WebSocket server for the LLM Game Master.
//!
//! ```bash
//! cargo run -p gm-server -- --bind 127.0.0.1:8080 --save-dir saves
//! ```
//!
//! Clients connect to `/ws`, optionally with `?session_id=<id>` to reattach.

mod state;
mod ws;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use claude::Claude;
use gm_core::llm::ModelProvider;
use gm_core::lore::LoreService;
use gm_core::{GameMaster, GmConfig, KeywordLore, Language, SessionManager, WorldPack};
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gm-server", about = "LLM Game Master over WebSocket")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// World pack JSON used for new sessions (built-in sample when omitted)
    #[arg(long)]
    world: Option<PathBuf>,

    /// Lore entries JSON for the keyword lore service
    #[arg(long)]
    lore: Option<PathBuf>,

    /// Directory for session saves; enables autosave and reattach after restart
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Evict sessions idle for this many seconds
    #[arg(long, default_value_t = 1800)]
    idle_timeout: i64,

    /// Model override for the Game Master
    #[arg(long)]
    model: Option<String>,

    /// Language for sessions whose client does not say
    #[arg(long, default_value = "en")]
    lang: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gm_core=debug")),
        )
        .init();

    let args = Args::parse();

    let claude = Claude::from_env().context(
        "ANTHROPIC_API_KEY is not set; put it in .env or export it before starting the server",
    )?;
    let model: Arc<dyn ModelProvider> = Arc::new(claude);

    let mut config = GmConfig::from_env();
    if let Some(name) = args.model.clone() {
        config = config.with_model(name);
    }

    let pack = match &args.world {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading world pack {}", path.display()))?;
            WorldPack::from_json(&json)
                .with_context(|| format!("parsing world pack {}", path.display()))?
        }
        None => WorldPack::sample(),
    };

    let lore: Option<Arc<dyn LoreService>> = match &args.lore {
        Some(path) => {
            let index = KeywordLore::load(path)
                .await
                .with_context(|| format!("loading lore {}", path.display()))?;
            tracing::info!(entries = index.len(), "Loaded lore index");
            Some(Arc::new(index) as Arc<dyn LoreService>)
        }
        None => None,
    };

    let chunk_size = config.chunk_size;
    let mut gm = GameMaster::new(model).with_config(config);
    if let Some(lore) = lore {
        gm = gm.with_lore(lore);
    }

    let mut manager = SessionManager::new(Arc::new(gm));
    if let Some(dir) = &args.save_dir {
        manager = manager.with_save_dir(dir);
    }
    let manager = Arc::new(manager);

    spawn_eviction(manager.clone(), args.idle_timeout);

    let state = Arc::new(AppState {
        manager,
        pack,
        chunk_size,
        default_language: Language::from_code(&args.lang),
    });

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(bind = %args.bind, "Game Master server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.manager.len(),
    }))
}

fn spawn_eviction(manager: Arc<SessionManager>, idle_secs: i64) {
    let max_idle = chrono::Duration::seconds(idle_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let evicted = manager.evict_idle(max_idle);
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "Evicted idle sessions");
            }
        }
    });
}
