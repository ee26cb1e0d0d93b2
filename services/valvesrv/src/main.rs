//! Valve Service (`valvesrv`)
//!
//! Reads telemetry from the valve controller, enforces the safety rules and
//! fans state out to subscribers.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use common::bootstrap_args::ServiceArgs;
use common::service_bootstrap::{self, LoggingOptions, ServiceInfo};
use errors::ValveResult;
use valvesrv::{ValveService, ValvesrvConfig};

#[derive(Parser, Debug)]
#[command(name = "valvesrv", version, about = "Valve telemetry and safety service")]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,

    /// Configuration file (yaml, json or toml)
    #[arg(short, long, env = "VALVESRV_CONFIG")]
    config: Option<PathBuf>,

    /// Device endpoint override: serial path, AUTO, or tcp://host:port
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Run against the built-in simulated device
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> ValveResult<()> {
    service_bootstrap::load_development_env();
    let args = Args::parse();

    let mut config = ValvesrvConfig::load(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.link.endpoint = endpoint;
    }

    let info = ServiceInfo::new(
        config.service.name.clone(),
        env!("CARGO_PKG_VERSION"),
        "Valve telemetry ingestion and safety supervision",
    );
    service_bootstrap::init_logging(
        &info,
        &LoggingOptions {
            level: Some(args.service.effective_level(&config.logging.level)),
            dir: args.service.effective_log_dir(config.logging.dir.as_deref()),
            file: config.logging.file,
            json: config.logging.json,
            no_color: args.service.no_color,
        },
    )?;
    if !args.service.no_color {
        service_bootstrap::print_startup_banner(&info);
    }

    // load() already validated
    if args.service.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let service = match ValveService::from_config(config, args.simulate) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start service: {}", e);
            return Err(e);
        },
    };

    let signal = common::shutdown::wait_for_shutdown().await;
    service.shutdown().await;
    info!("[OK] {} stopped after {}", info.name, signal);
    Ok(())
}
