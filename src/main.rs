use std::process;

use clap::Parser;

use fastport::config::{load_config, Config};
use fastport::logging::init_logging;
use fastport::run;

#[derive(Debug, Parser)]
#[command(name = "fastportd", version, about = "fastPort broker daemon")]
struct Cli {
    /// Path to config TOML; missing file falls back to built-in defaults.
    #[arg(short, long, default_value = "fastport.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let config: Config = if std::path::Path::new(&cli.config).exists() {
        match load_config(&cli.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[FATAL] failed to load config: {e}");
                process::exit(1);
            }
        }
    } else {
        Config::default()
    };
    let config = config.apply_env();

    if let Err(e) = run(config).await {
        eprintln!("[FATAL] broker crashed: {e}");
        process::exit(1);
    }
}
