// llama-router: serves many models behind one HTTP endpoint, one worker
// process per loaded model.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};

use llama_router::web::config::RouterConfig;
use llama_router::web::logger::setup_logging;
use llama_router::web::registry::ModelRegistry;
use llama_router::web::server::run_server;
use llama_router::web::worker::invocation::strip_router_keys;
use llama_router_config::{ArgRegistry, PresetContext, PresetSources};

/// How long in-flight requests may keep the server alive after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let context = PresetContext::new(Arc::new(ArgRegistry::server_defaults()));

    if argv.iter().any(|a| a == "-h" || a == "--help") {
        println!("Usage: llama_router [OPTIONS]\n");
        print!("{}", context.registry().help_text());
        return Ok(());
    }

    let options = context
        .load_from_args(&argv)
        .context("invalid command line")?;
    let config = RouterConfig::from_options(context.registry(), &options)
        .context("invalid router settings")?;

    if let Err(e) = setup_logging(config.log_file.as_deref(), config.verbose) {
        eprintln!("Failed to set up logging: {e}");
    }

    let mut base = options.clone();
    strip_router_keys(&mut base, true);
    let sources = PresetSources {
        cache_dir: config.cache_dir.clone(),
        models_dir: config.models_dir.clone(),
        preset_file: config.models_preset.clone(),
        base,
    };
    let resolved = context
        .resolve(&sources)
        .context("failed to load model presets")?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    let registry = ModelRegistry::from_presets(config, Arc::clone(context.registry()), resolved)?;
    registry.load_startup_models()?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run_server(listener, Arc::clone(&registry), async move {
            let _ = stop_rx.await;
        }));

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
        let _ = stop_tx.send(());

        match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("HTTP server error: {e}"),
            Ok(Err(e)) => error!("HTTP server task failed: {e}"),
            Err(_) => warn!(
                "Requests still running after {}s, stopping workers anyway",
                SHUTDOWN_GRACE.as_secs()
            ),
        }

        info!("Unloading all models");
        let unloading = Arc::clone(&registry);
        if let Err(e) = tokio::task::spawn_blocking(move || unloading.unload_all()).await {
            error!("Unload task failed: {e}");
        }
    });

    info!("Router stopped");
    Ok(())
}
