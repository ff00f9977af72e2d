use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use backchannel::config::Config;
use backchannel::engine::{self, Engine};
use backchannel::irc::listener::{self, Listener};
use backchannel::slack::api::ApiClient;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: backchannel <config-file>");
        return ExitCode::FAILURE;
    };
    let cfg = match Config::load(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match Listener::bind(&cfg).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind IRC listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("backchannel starting");

    let dump = Arc::new(AtomicBool::new(cfg.debug_dump));
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (api_tx, api_rx) = mpsc::unbounded_channel();
    let api = Arc::new(ApiClient::new(&cfg.slack_token));

    tokio::spawn(engine::run_api(api.clone(), api_rx, input_tx.clone()));
    tokio::spawn(listener::run(listener, input_tx.clone(), dump.clone()));

    let mut engine = Engine::new(&cfg, api, input_tx, api_tx, dump);
    engine.start();
    engine.run(input_rx).await;

    ExitCode::SUCCESS
}
