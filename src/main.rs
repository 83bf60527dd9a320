mod config;
mod lock;
mod monitor;
mod run_log;
mod runner;
mod source;

use clap::Parser;
use std::path::PathBuf;

/// Runs one traffic-monitor cycle: validate `config.sh`, pull the latest
/// source, invoke the monitor, append everything to the run log, and exit
/// with the monitor's status. Meant to be called from cron with no
/// arguments.
#[derive(Parser, Debug)]
#[command(name = "traffic-runner", version, about)]
pub struct Cli {
    /// Config file path (default: config.sh beside this executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Pass --debug to the monitor
    #[arg(long)]
    debug: bool,

    /// Extra logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "traffic_runner=debug"
    } else {
        "traffic_runner=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    if cli.dry_run {
        std::process::exit(dry_run(&config_path));
    }

    let options = runner::RunOptions {
        force_debug: cli.debug,
        ..runner::RunOptions::new(config_path)
    };
    let code = runner::run(&options).await;
    std::process::exit(code);
}

fn dry_run(config_path: &std::path::Path) -> i32 {
    let (config, _log) = match runner::load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Config invalid: {}", e.error);
            return runner::EXIT_FAILURE;
        }
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Failed to serialize config: {e}");
            runner::EXIT_FAILURE
        }
    }
}
