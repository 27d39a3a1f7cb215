use std::sync::Arc;

use clap::Parser;
use tracing::info;

use clawgate::cli::{self, Cli, Command, ConfigCommand};
use clawgate::config;
use clawgate::logging::{self, LogConfig};
use clawgate::server::startup::{
    await_shutdown_trigger, run_server_with_config, ServerConfig, DEFAULT_SHUTDOWN_GRACE,
};
use clawgate::server::ws::{build_ws_config_from_value, resolve_bind_address, WsServerState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }

        Some(Command::Sign {
            secret,
            challenge_id,
            nonce,
            client_id,
            role,
            node_id,
        }) => cli::handle_sign(
            &secret,
            &challenge_id,
            &nonce,
            &client_id,
            &role,
            node_id.as_deref(),
        ),
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    logging::init_logging(LogConfig::from_env().with_config(&cfg)?)?;
    config::report_validation_issues(&cfg);

    let ws_config = build_ws_config_from_value(&cfg)?;
    let bind_address = resolve_bind_address(&cfg)?;
    let ws_state = Arc::new(WsServerState::new(ws_config));

    info!(
        target: "gateway",
        config_path = %config::get_config_path().display(),
        "starting clawgate {}",
        env!("CARGO_PKG_VERSION")
    );

    let handle = run_server_with_config(ServerConfig::new(ws_state, bind_address)).await?;

    let reason = await_shutdown_trigger().await;
    info!(target: "gateway", reason, "shutdown requested");
    handle
        .shutdown_with_grace(reason, DEFAULT_SHUTDOWN_GRACE)
        .await;
    Ok(())
}
