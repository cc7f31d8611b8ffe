#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use vpp_agent::link::LoopbackTransport;
use vpp_agent::observability::init_tracing;
use vpp_agent::{Agent, AgentConfig, AgentExit, RESTART_EXIT_CODE};

const DEFAULT_CONFIG_PATH: &str = "./configuration.toml";

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match AgentConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vpp-agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("vpp-agent: unable to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!(config = %path, source = %config.source_id(), "Starting vpp-monitoring-agent");

    // No shared-memory client is linked in; run against the in-process engine.
    let transport = Arc::new(LoopbackTransport::new(std::process::id()));

    let agent = match Agent::start(config, transport).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Unable to start agent");
            return ExitCode::FAILURE;
        }
    };

    match agent.run_until(tokio::signal::ctrl_c()).await {
        AgentExit::Failure(failure) => {
            error!(failure = %failure, "Exiting for restart");
            ExitCode::from(RESTART_EXIT_CODE)
        }
        AgentExit::Shutdown => ExitCode::SUCCESS,
    }
}
