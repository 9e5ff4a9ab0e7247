use clap::{Parser, Subcommand};
use std::sync::Arc;
use switchboard::channels::{MessagingClient, TelegramClient};
use switchboard::debug::{self, DebugState};
use switchboard::handlers::{EchoHandler, HelpHandler};
use switchboard::{Dispatcher, StateHandler};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Switchboard CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: SWITCHBOARD_CONFIG_PATH or ~/.switchboard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// List the commands the bot answers to.
    Commands,

    /// Run the bot: poll Telegram and dispatch updates to per-chat state machines until Ctrl+C.
    Run {
        /// Config file path (default: SWITCHBOARD_CONFIG_PATH or ~/.switchboard/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// First update id to fetch (default from config or 0)
        #[arg(long)]
        offset: Option<i64>,

        /// Debug endpoint port (default from config or 15152)
        #[arg(long)]
        debug_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Commands) => {
            for h in builtin_handlers() {
                println!("{}\t{}", h.command(), h.description());
            }
        }
        Some(Commands::Run {
            config,
            offset,
            debug_port,
        }) => {
            if let Err(e) = run_bot(config, offset, debug_port).await {
                log::error!("bot failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Handlers registered with the dispatcher, `/help` last so it can list the others.
fn builtin_handlers() -> Vec<Arc<dyn StateHandler>> {
    let mut handlers: Vec<Arc<dyn StateHandler>> = vec![Arc::new(EchoHandler)];
    let help = HelpHandler::for_handlers(&handlers);
    handlers.push(Arc::new(help));
    handlers
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(switchboard::config::default_config_path);
    let dir = switchboard::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bot(
    config_path: Option<std::path::PathBuf>,
    offset: Option<i64>,
    debug_port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = switchboard::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    if let Some(o) = offset {
        config.polling.offset = o;
    }
    if let Some(p) = debug_port {
        config.debug.port = p;
    }

    let token = switchboard::config::resolve_telegram_token(&config).ok_or_else(|| {
        anyhow::anyhow!("telegram bot token not configured (set telegram.botToken or TELEGRAM_BOT_TOKEN)")
    })?;
    let telegram = TelegramClient::new(Some(token), config.telegram.api_base.clone());
    let client: Arc<dyn MessagingClient> = Arc::new(telegram.clone());

    let mut dispatcher = builtin_handlers()
        .into_iter()
        .fold(Dispatcher::builder().client(client), |b, h| b.handler(h))
        .options(config.dispatcher_options())
        .build()?;

    let cancel = CancellationToken::new();

    let debug_task = if config.debug.enabled {
        let state = DebugState {
            stats: dispatcher.stats(),
            tracker: dispatcher.tracker(),
        };
        let bind = config.debug.bind.clone();
        let port = config.debug.port;
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = debug::run_debug_server(&bind, port, state, token).await {
                log::warn!("debug endpoint failed: {:#}", e);
            }
        }))
    } else {
        None
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let result = dispatcher
        .run(
            cancel.clone(),
            config.polling.offset,
            config.polling.effective_limit(),
        )
        .await;

    telegram.stop();
    cancel.cancel();
    if let Some(task) = debug_task {
        if let Err(e) = task.await {
            log::error!("debug endpoint task failed: {}", e);
        }
    }
    log::info!("bot stopped");
    result.map_err(Into::into)
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping dispatcher and draining conversations");
}
