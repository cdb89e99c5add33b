use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gw_server::state::AppState;
use gw_server::{config::GatewayConfig, serve};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gateway-engine")]
#[command(about = "Self-hosted gateway for a bounded pool of CLI worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP/WebSocket gateway. Settings come from `GATEWAY_*`
    /// environment variables; there are no flags, matching the closed
    /// configuration surface.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _cli = Cli::parse();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        return ExitCode::from(2);
    }

    let logs_dir = gw_observability::canonical_logs_dir_from_root(&config.state_dir);
    let _guard = match gw_observability::init_logging(&logs_dir, 14, config.log_format) {
        Ok((guard, _info)) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(1);
        }
    };

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("invalid GATEWAY_HOST/GATEWAY_PORT combination");
            return ExitCode::from(2);
        }
    };

    let state = match AppState::bootstrap(config).await {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::from(1);
        }
    };

    info!(%addr, "starting gateway");
    if let Err(err) = serve(addr, state).await {
        error!(error = %err, "gateway exited with an error");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
