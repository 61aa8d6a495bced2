//! CLI overrides for the two-layer (file + CLI) config pattern (spec §6),
//! matching the teacher's `ServerConfig` bootstrap idiom.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "playhouse-server", about = "PlayHouse Play/API server host")]
pub struct Cli {
    /// Path to a RON config file (`PlayServerOptions` or `ApiServerOptions`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Overrides the tracing log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn init_tracing(&self) {
        let filter = self.log_level.clone().unwrap_or_else(|| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
