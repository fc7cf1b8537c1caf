//! CLI flags: `-c`/`--config-file <path>` (default `messageman.yml`).

use clap::Parser;
use messageman_core::config::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(name = "messageman", about = "Message-bus adapter: REST/gRPC ingress over a direct-exchange broker")]
pub struct Args {
    /// Path to a messageman configuration YAML file.
    #[arg(short = 'c', long = "config-file", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,

    /// Bound main API name, set only in sidecar mode.
    #[arg(long)]
    pub main_api: Option<String>,
}
