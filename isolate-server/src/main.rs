use std::sync::Arc;

use isolate_common::tracing::init_tracing_with_default_env_filter;
use isolate_executor::bridge::process::{AgentBinary, ProcessAgentBridgeFactory};
use isolate_executor::bridge_manager::BridgeManager;
use isolate_executor::runner::{PipelineConfig, PipelineDeps};
use isolate_server::config::{make_config_loader, IsolateServerConfig};
use isolate_server::metrics;
use isolate_server::pool::RunnerPool;
use isolate_server::registry::TaskRegistry;
use isolate_server::server::start_grpc_server;
use isolate_server::servicer::IsolateGrpcApi;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };
    let config = config.with_spec_env_overrides();

    init_tracing_with_default_env_filter(&config.tracing);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: IsolateServerConfig) -> Result<(), std::io::Error> {
    for dir in [&config.cache_root, &config.socket_root] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| std::io::Error::other(format!("failed to create {dir:?}: {e}")))?;
    }

    let bridge_factory = Arc::new(ProcessAgentBridgeFactory::new(
        AgentBinary(config.agent_binary.clone()),
        config.socket_root.clone(),
        config.max_grpc_wait_timeout,
    ));
    let bridge_manager = Arc::new(BridgeManager::new(bridge_factory));

    let pipeline_deps = PipelineDeps {
        bridge_manager: bridge_manager.clone(),
        config: PipelineConfig {
            empty_message_interval: config.empty_message_interval,
            cache_root: config.cache_root.clone(),
            inherit_from_local: config.inherit_from_local,
            agent_requirements: config.agent_requirements(),
        },
    };

    let (_prometheus_registry, service_metrics) = metrics::register_all();
    let registry = Arc::new(TaskRegistry::new());
    let pool = Arc::new(RunnerPool::new(config.max_threads));

    let api = IsolateGrpcApi::new(pipeline_deps, registry, pool, service_metrics);

    let addr = config
        .grpc_address()
        .parse()
        .map_err(|e| std::io::Error::other(format!("invalid grpc address {}: {e}", config.grpc_address())))?;

    info!("isolate-server listening on {addr}");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested, terminating pooled agent bridges");
        bridge_manager.terminate_all().await;
    };

    tokio::select! {
        result = start_grpc_server(addr, api) => {
            if let Err(e) = &result {
                error!("gRPC server failed: {e}");
            }
            result.map_err(|e| std::io::Error::other(e.to_string()))
        }
        _ = shutdown => Ok(()),
    }
}
