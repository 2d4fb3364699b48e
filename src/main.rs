//! Stager - Entry Point
//!
//! Staging coordinator for the platform: converts Cloud Controller
//! staging requests into task recipes for the downstream scheduler and
//! reports task completions back as staging responses.

use std::collections::HashMap;
use std::env;

use stager::app::options::AppOptions;
use stager::app::run::run;
use stager::backend;
use stager::http::cc_client::CcClientOptions;
use stager::logs::{init_logging, LogOptions};
use stager::nats::client::NatsAddress;
use stager::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version_info()).unwrap());
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: flag(&cli_args, "logLevel")
            .parse()
            .unwrap_or_default(),
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // The lifecycles flag maps lifecycle keys to builder bundle locations
    let lifecycles: HashMap<String, String> =
        match serde_json::from_str(&flag_or(&cli_args, "lifecycles", "{}")) {
            Ok(lifecycles) => lifecycles,
            Err(e) => {
                error!("Error parsing lifecycles flag: {}", e);
                std::process::exit(1);
            }
        };

    let options = AppOptions {
        nats: NatsAddress {
            addresses: flag(&cli_args, "natsAddresses"),
            username: flag(&cli_args, "natsUsername"),
            password: flag(&cli_args, "natsPassword"),
        },
        cc: CcClientOptions {
            base_url: flag(&cli_args, "ccBaseURL"),
            username: flag(&cli_args, "ccUsername"),
            password: flag(&cli_args, "ccPassword"),
            skip_cert_verify: bool_flag(&cli_args, "skipCertVerify"),
            ..Default::default()
        },
        diego_api_url: flag(&cli_args, "diegoAPIURL"),
        server: stager::server::serve::ServerOptions {
            listen_addr: flag_or(&cli_args, "listenAddr", "0.0.0.0:8888"),
            ..Default::default()
        },
        backend: backend::Config {
            task_domain: flag(&cli_args, "taskDomain"),
            stager_url: flag(&cli_args, "stagerURL"),
            file_server_url: flag(&cli_args, "fileServerURL"),
            cc_uploader_url: flag(&cli_args, "ccUploaderURL"),
            lifecycles,
            docker_staging_stack: flag(&cli_args, "dockerStagingStack"),
            docker_registry_address: flag(&cli_args, "dockerRegistryAddress"),
            insecure_docker_registry: bool_flag(&cli_args, "insecureDockerRegistry"),
            consul_cluster: flag(&cli_args, "consulCluster"),
            skip_cert_verify: bool_flag(&cli_args, "skipCertVerify"),
            min_memory_mb: uint_flag(&cli_args, "minMemoryMB", 1024),
            min_disk_mb: uint_flag(&cli_args, "minDiskMB", 3072),
            min_file_descriptors: uint_flag(&cli_args, "minFileDescriptors", 0),
            ..Default::default()
        },
        ..Default::default()
    };

    info!("Running stager");
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Stager exited with error: {e}");
        std::process::exit(1);
    }
}

fn flag(cli_args: &HashMap<String, String>, name: &str) -> String {
    cli_args.get(name).cloned().unwrap_or_default()
}

fn flag_or(cli_args: &HashMap<String, String>, name: &str, default: &str) -> String {
    cli_args
        .get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn bool_flag(cli_args: &HashMap<String, String>, name: &str) -> bool {
    cli_args.get(name).map(|v| v == "true").unwrap_or(false)
}

fn uint_flag<T: std::str::FromStr>(cli_args: &HashMap<String, String>, name: &str, default: T) -> T {
    cli_args
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
