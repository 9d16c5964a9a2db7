use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{BackendKind, Config};

#[derive(Parser, Debug)]
#[command(name = "iothub")]
#[command(about = "Multi-tenant IoT control plane: one broker service per tenant")]
#[command(version)]
pub struct Args {
    /// Path to the YAML config file (default: ~/.iothub/config.yaml)
    #[arg(short, long, value_name = "FILE", env = "IOTHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the cluster backend selected in the config file
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Override the notification ingress address
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Path to a .env file loaded before the config is expanded
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Validate the config and print the resolved setup without starting
    #[arg(long)]
    pub dry_run: bool,
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Describe the resolved configuration for `--dry-run`
pub fn format_dry_run(config: &Config, config_path: &str) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "iothub v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n\n", config_path));

    let backend = match config.backend {
        BackendKind::ManagedOrchestrator => {
            let api = config
                .kubernetes
                .as_ref()
                .map(|k| format!("{} (image {})", k.api_server, k.image))
                .unwrap_or_default();
            format!("managed-orchestrator {}", api)
        }
        BackendKind::Swarm => {
            let image = config
                .swarm
                .as_ref()
                .map(|s| format!("(image {})", s.image))
                .unwrap_or_default();
            format!("swarm {}", image)
        }
        BackendKind::Local => {
            let command = config
                .local
                .as_ref()
                .map(|l| {
                    format!(
                        "({} {}, ports {}-{})",
                        l.command,
                        l.args.join(" "),
                        l.port_base,
                        l.port_base.saturating_add(l.port_range)
                    )
                })
                .unwrap_or_default();
            format!("local {}", command)
        }
    };
    output.push_str(&format!("Backend:   {}\n", backend.trim_end()));
    output.push_str(&format!("Network:   {}\n", config.network));
    output.push_str(&format!("Timeout:   {}s\n", config.backend_timeout_secs));

    let discovery = match &config.discovery {
        crate::config::DiscoveryConfig::None => "none".to_string(),
        crate::config::DiscoveryConfig::Memory => "memory".to_string(),
        crate::config::DiscoveryConfig::Etcd(etcd) => {
            format!("etcd {} (prefix {})", etcd.endpoint, etcd.prefix)
        }
    };
    output.push_str(&format!("Discovery: {}\n", discovery));

    let store = match config.state_path() {
        Some(path) => format!("file {}", path.display()),
        None => "memory".to_string(),
    };
    output.push_str(&format!("Store:     {}\n", store));
    output.push_str(&format!("Ingress:   {}\n", config.ingress.listen));

    output
}
