//! kg-server — versioned knowledge-graph construction and query service.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI flags
//!   3. Load config (YAML)
//!   4. Init logger (CLI `-v` flags > env > config)
//!   5. Connect stores, ensure schema, sweep any crashed task to FAILED
//!   6. Wire hooks, LLM clients, throttles, extractor, orchestrator
//!   7. Spawn Ctrl-C → shutdown watcher
//!   8. Serve HTTP until shutdown, then join the in-flight pipeline

use tokio_util::sync::CancellationToken;
use tracing::info;

use kg_server::api::{self, ApiState};
use kg_server::build::BuildService;
use kg_server::core::config;
use kg_server::core::error::AppError;
use kg_server::extract::{llm::LlmExtractor, Extractor};
use kg_server::hooks;
use kg_server::llm::providers;
use kg_server::logger;
use kg_server::storage;
use kg_server::throttle::Throttle;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present — ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;
    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level)?;

    info!(
        host = %config.server.host,
        port = config.server.port,
        backend = if config.neo4j.is_memory() { "memory" } else { "neo4j" },
        hooks = %config.hooks.module,
        llm_provider = %config.llm.provider,
        llm_model = %config.llm.model,
        "config loaded"
    );

    let (metadata, graph) = storage::build(&config.neo4j)?;
    metadata.ensure_schema().await?;
    metadata.recover_on_startup().await?;

    let hooks = hooks::build(&config.hooks)?;

    let chat = providers::build_chat(&config.llm)
        .map_err(|e| AppError::Config(e.to_string()))?;
    let embeddings = providers::build_embeddings(&config.embeddings)
        .map_err(|e| AppError::Config(e.to_string()))?;
    let chat_throttle = Throttle::new(
        config.llm.concurrency,
        config.llm.rate_limit,
        &config.llm.retry,
    );
    let embeddings_throttle = Throttle::new(
        config.embeddings.concurrency,
        config.embeddings.rate_limit,
        &config.embeddings.retry,
    );
    let extractor = Extractor::Llm(LlmExtractor::new(
        chat,
        embeddings,
        chat_throttle,
        embeddings_throttle,
    ));

    // Shared shutdown token — Ctrl-C cancels it, all tasks watch it.
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received — initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let build = BuildService::new(
        metadata,
        graph,
        hooks,
        extractor,
        config.retention,
        config.task.timeout_s,
        shutdown.clone(),
    );

    let router = api::build_router(
        ApiState {
            build: build.clone(),
            query: config.query,
        },
        &config.server.cors_allow_origins,
    );
    let served = api::serve(&config.server, router, shutdown.clone()).await;

    // The server is down; make sure an in-flight pipeline observes shutdown
    // and finishes its failure bookkeeping before the process exits.
    shutdown.cancel();
    build.join_running().await;

    served
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: kg-server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.yaml)");
                println!("  -v, -vv, -vvv              Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(path);
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    // Each -v raises verbosity one tier above the config default:
    //   -v   → info
    //   -vv  → debug
    //   -vvv → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs { log_level, config_path }
}
