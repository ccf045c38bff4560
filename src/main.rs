//! blastbox: automated malware detonation sandbox service.
//!
//! Loads the YAML configuration, wires the collaborators — VM controller,
//! pool, collector registry, result store, orchestrator — and serves the
//! HTTP API until interrupted. All collaborators are constructed here and
//! passed down explicitly; nothing is looked up ambiently.
//!
//! Exit codes: 0 on clean shutdown, 2 on configuration errors, 3 on runtime
//! errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use blastbox::api::{self, AppState};
use blastbox::collect::CollectorRegistry;
use blastbox::config::Settings;
use blastbox::logging;
use blastbox::orchestrator::Orchestrator;
use blastbox::pipeline::PipelineDeps;
use blastbox::store::ResultStore;
use blastbox::vm::{VBoxManageController, VmPool};

/// Automated malware detonation sandbox
#[derive(Parser, Debug)]
#[command(name = "blastbox", version, about = "Automated malware detonation sandbox")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init();

    let settings = match Settings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration error");
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create runtime: {e}");
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(serve(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "runtime error");
            eprintln!("runtime error: {e:#}");
            ExitCode::from(3)
        }
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let controller = Arc::new(
        VBoxManageController::new(&settings.virtualization.vboxmanage_path)
            .context("initialize VM controller")?,
    );
    let pool = Arc::new(VmPool::new(settings.vm_names()));
    let collectors = Arc::new(CollectorRegistry::standard());
    let store = Arc::new(ResultStore::new());

    let deps = PipelineDeps {
        controller,
        pool: pool.clone(),
        collectors,
        analysis: settings.analysis.clone(),
    };
    let (orchestrator, queue_rx) = Orchestrator::new(deps, store.clone(), settings.vms.clone());
    let worker = orchestrator.start(queue_rx);

    let state = AppState {
        orchestrator: orchestrator.clone(),
        store,
        pool,
        settings: settings.clone(),
    };
    let app = api::router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        %addr,
        vms = settings.vms.len(),
        "blastbox v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;

    // Running pipelines get a cancel and drive themselves through cleanup.
    info!("shutting down");
    orchestrator.stop();
    let _ = worker.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
