mod analysis;
mod config;
mod demux;
mod engine;
mod evaluator;
mod grader;
mod hosting;
mod intake;
mod orchestrator;
mod server;
mod store;


use analysis::{LinterCommand, StaticAnalysisGate};
use anyhow::Context;
use config::ModuleConfigManager;
use demux::FrameLayout;
use engine::{DockerSandbox, SandboxImage};
use grader::ExerciseGrader;
use hosting::GitCliHost;
use intake::{AdmissionPolicy, IntakeQueue, ModuleGradingJob};
use orchestrator::Orchestrator;
use server::AppState;
use shortgrade_common::config::Config;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, RedisStore, SubmissionStore};
use tokio::signal;
use tracing::{error, info, warn};

/// `REDIS_URL` value selecting the non-persistent store.
const IN_MEMORY_STORE: &str = "memory";

/// Time granted to in-flight gradings once the sandbox units are gone.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Shortgrade worker booting...");

    let config = Config::from_env();
    if config.dev_mode {
        warn!("DEV_MODE enabled: backoff gate is bypassed");
    }

    let catalog = ModuleConfigManager::load(&config.modules_config).map_err(|e| {
        error!("Failed to load module definitions: {:#}", e);
        error!("Make sure {} exists", config.modules_config.display());
        e
    })?;
    info!("Loaded modules: {:?}", catalog.module_ids());

    let framing: FrameLayout = config
        .sandbox_log_framing
        .parse()
        .map_err(anyhow::Error::msg)
        .context("Invalid SANDBOX_LOG_FRAMING")?;
    let image = SandboxImage {
        name: config.sandbox_image.clone(),
        dockerfile: config.sandbox_dockerfile.clone(),
    };
    let sandbox = Arc::new(DockerSandbox::connect(image, framing, config.trace_output_limit)?);
    sandbox.prepare().await.context("Failed to prepare sandbox image")?;
    info!("Sandbox image ready: {}", config.sandbox_image);

    let store: Arc<dyn SubmissionStore> = if config.redis_url == IN_MEMORY_STORE {
        warn!("Using in-memory submission store: state is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let client = ::redis::Client::open(config.redis_url.as_str())?;
        let redis_conn = ::redis::aio::ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis: {}", config.redis_url);
        Arc::new(RedisStore::new(redis_conn))
    };

    let host = Arc::new(GitCliHost::new(
        config.repo_remote_base.clone(),
        config.repo_owner.clone(),
        config.workdir.join("scratch"),
    ));
    let linter = LinterCommand::from_command_line(&config.linter_command).unwrap_or_default();
    let grader = Arc::new(ExerciseGrader::new(StaticAnalysisGate::new(linter), sandbox.clone()));
    let orchestrator = Arc::new(
        Orchestrator::new(store, host, grader, config.workdir.clone())
            .with_dev_mode(config.dev_mode)
            .with_output_limit(config.trace_output_limit),
    );

    let job = Arc::new(ModuleGradingJob::new(Arc::new(catalog), orchestrator));
    let intake = Arc::new(IntakeQueue::start(job, config.max_concurrent_gradings));
    let state = AppState {
        intake: intake.clone(),
        policy: Arc::new(AdmissionPolicy::from_config(&config)),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        warn!("Received shutdown signal, stopping gradings...");
    };
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    intake.close();
    match sandbox.emergency_stop().await {
        Ok(removed) => info!(removed, "Grading containers removed"),
        Err(e) => error!(error = %e, "Failed to remove grading containers"),
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, intake.shutdown()).await.is_err() {
        warn!("Gradings still running at shutdown");
    }

    info!("Worker shutdown complete");
    Ok(())
}
