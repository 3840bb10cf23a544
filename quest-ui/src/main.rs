//! Quest UI server - web interface and background poller for quest instances.

mod poller;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use quest::io::config::{config_path, load_config};
use quest::session::{Orchestrator, QuestSession};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "quest-ui")]
#[command(about = "Web UI that keeps quest instances in sync with their forge")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Learner working copy to orchestrate (repeatable)
    #[arg(long = "workdir", default_value = ".")]
    workdirs: Vec<PathBuf>,

    /// Directory containing UI static files (defaults to ./ui/dist relative to the first workdir)
    #[arg(long)]
    ui_dir: Option<PathBuf>,

    /// Serve the API without starting timer or file-watch polling
    #[arg(long)]
    no_poll: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quest_ui=info".parse()?)
                .add_directive("quest=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut orchestrator = Orchestrator::new();
    let mut first_workdir = None;
    for workdir in &args.workdirs {
        let workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.clone());
        let config = load_config(&config_path(&workdir))
            .with_context(|| format!("load config for {}", workdir.display()))?;
        let session = QuestSession::open(&workdir, config)
            .with_context(|| format!("open quest instance at {}", workdir.display()))?;
        if orchestrator.session(session.id()).is_ok() {
            bail!(
                "duplicate instance id '{}' at {}",
                session.id(),
                workdir.display()
            );
        }
        info!(instance = %session.id(), workdir = %workdir.display(), "opened quest instance");
        orchestrator.insert(session);
        if first_workdir.is_none() {
            first_workdir = Some(workdir);
        }
    }

    let state = AppState::new(orchestrator);

    sse::start_view_forwarders(&state);
    if !args.no_poll {
        poller::start_timer_pollers(&state);
        poller::start_file_watchers(&state);
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state.clone());

    let ui_dir = args.ui_dir.or_else(|| first_workdir.map(|dir| dir.join("ui").join("dist")));
    match ui_dir {
        Some(ui_dir) if ui_dir.exists() => {
            info!(ui_dir = %ui_dir.display(), "serving static UI files");
            let static_files = ServeDir::new(ui_dir).append_index_html_on_directories(true);
            app = app.fallback_service(static_files);
        }
        _ => info!("UI directory not found, API-only mode"),
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Resolve on Ctrl-C and cancel in-flight cycles between actions.
async fn shutdown_signal(state: AppState) {
    if tokio::signal::ctrl_c().await.is_err() {
        return std::future::pending().await;
    }
    info!("shutting down");
    for session in state.orchestrator.sessions() {
        session.cancel();
    }
}
