//! Server entry point: assembles the runtime and serves the query API.
//!
//! Configuration comes from a TOML file named by `HIVEMIND_CONFIG`, or
//! from environment variables when no file is given.

use std::path::PathBuf;

use hivemind::api::{self, ApiState};
use hivemind::config::Config;
use hivemind::MemoryRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("HIVEMIND_CONFIG").ok() {
        Some(path) => Config::from_file(&PathBuf::from(path))?,
        None => Config::from_env()?,
    };
    hivemind::logging::init(&config.logging);

    let api_config = config.api.clone();
    let runtime = MemoryRuntime::new(config)?;
    runtime.start().await?;

    let state = ApiState {
        agent: runtime.agent.clone(),
        retrieval: runtime.retrieval.clone(),
        knowledge: runtime.knowledge.clone(),
    };

    tokio::select! {
        result = api::serve(state, &api_config.host, api_config.port) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
    }

    runtime.shutdown().await;
    Ok(())
}
