pub mod agent_engine;
pub mod commands;
pub mod config;
pub mod errors;
pub mod executor;
pub mod perception;
pub mod planner;
pub mod platform;
pub mod storage;

use crate::agent_engine::engine::AgentEngine;
use crate::agent_engine::history::ActionLog;
use crate::config::AppConfig;
use crate::errors::DeskResult;
use crate::storage::StateStore;

/// Boots the agent: logging, configuration, adapter, planner, orchestrator
/// thread, then the stdin console until `quit` or end of input.
pub fn run() -> DeskResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config; starting with defaults");
            let mut cfg = AppConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let adapter = platform::build_adapter(&config.platform)?;
    let planner = planner::build_planner(&config.planner)?;
    let engine = AgentEngine::new(&config, adapter, planner)?;
    let handle = engine.handle();
    let data_dir = config.agent.resolved_data_dir();
    let store = StateStore::new(&data_dir, config.agent.emotion_dims);
    let log = ActionLog::new(&data_dir);

    tracing::info!("spawning orchestrator thread");
    let worker = engine.spawn()?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let console = commands::run_console(stdin.lock(), &mut stdout, &handle, &store, &log);

    handle.shutdown();
    if worker.join().is_err() {
        tracing::error!("orchestrator thread panicked");
    }
    console
}
